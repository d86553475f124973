//! Chain primitives shared by the simulated runtime, the tracker and the monitor.

use bytes::{Buf, BufMut};
use commonware_codec::{
    Encode, EncodeSize, Error as CodecError, Read, ReadExt, ReadRangeExt, Write,
};
use commonware_utils::hex;
use p256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum number of transactions accepted in a single block on decode.
pub const MAX_BLOCK_TRANSACTIONS: usize = 4096;

/// Gas consumed by a plain value transfer.
pub const TRANSFER_GAS: u64 = 21_000;

macro_rules! fixed_bytes {
    ($name:ident, $len:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl Default for $name {
            fn default() -> Self {
                Self([0u8; $len])
            }
        }

        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex(&self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex(&self.0))
            }
        }

        impl Write for $name {
            fn write(&self, buf: &mut impl BufMut) {
                self.0.write(buf);
            }
        }

        impl EncodeSize for $name {
            fn encode_size(&self) -> usize {
                $len
            }
        }

        impl Read for $name {
            type Cfg = ();

            fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
                Ok(Self(<[u8; $len]>::read(reader)?))
            }
        }
    };
}

fixed_bytes!(Hash, 32);
fixed_bytes!(Address, 20);
fixed_bytes!(PublicKey, 33);

impl Hash {
    /// SHA-256 of `data`.
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl PublicKey {
    /// The compressed SEC1 encoding of a verifying key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(point.as_bytes());
        Self(out)
    }

    /// Derives the account address of this key (last 20 bytes of its SHA-256).
    pub fn address(&self) -> Address {
        let digest = Hash::digest(&self.0);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest.0[12..]);
        Address(out)
    }

    fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_sec1_bytes(&self.0).ok()
    }
}

impl From<&SigningKey> for PublicKey {
    fn from(key: &SigningKey) -> Self {
        Self::from_verifying_key(key.verifying_key())
    }
}

/// A signed value transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub sender: PublicKey,
    pub to: Address,
    pub value: u64,
    pub gas: u64,
    pub gas_price: u64,
    pub signature: [u8; 64],
}

/// The unsigned portion of a [Transaction].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Address,
    pub value: u64,
    pub gas: u64,
    pub gas_price: u64,
}

impl UnsignedTransaction {
    fn payload(&self, sender: &PublicKey) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 * 5 + PublicKey::LEN + Address::LEN);
        self.chain_id.write(&mut buf);
        self.nonce.write(&mut buf);
        sender.write(&mut buf);
        self.to.write(&mut buf);
        self.value.write(&mut buf);
        self.gas.write(&mut buf);
        self.gas_price.write(&mut buf);
        buf
    }

    /// Sign the transaction with `key`.
    pub fn sign(self, key: &SigningKey) -> Transaction {
        let sender = PublicKey::from(key);
        let signature: Signature = key.sign(&self.payload(&sender));
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&signature.to_bytes());
        Transaction {
            chain_id: self.chain_id,
            nonce: self.nonce,
            sender,
            to: self.to,
            value: self.value,
            gas: self.gas,
            gas_price: self.gas_price,
            signature: bytes,
        }
    }
}

impl Transaction {
    fn unsigned(&self) -> UnsignedTransaction {
        UnsignedTransaction {
            chain_id: self.chain_id,
            nonce: self.nonce,
            to: self.to,
            value: self.value,
            gas: self.gas,
            gas_price: self.gas_price,
        }
    }

    /// Hash of the full (signed) encoding.
    pub fn hash(&self) -> Hash {
        Hash::digest(&self.encode())
    }

    /// Address of the account paying for the transaction.
    pub fn origin(&self) -> Address {
        self.sender.address()
    }

    /// Returns true if the signature was produced by `sender`.
    pub fn verify(&self) -> bool {
        let Some(key) = self.sender.verifying_key() else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        key.verify(&self.unsigned().payload(&self.sender), &signature)
            .is_ok()
    }

    /// Upper bound on what the sender pays: value plus the full gas allowance.
    pub fn cost(&self) -> u64 {
        self.value
            .saturating_add(self.gas.saturating_mul(self.gas_price))
    }
}

impl Write for Transaction {
    fn write(&self, buf: &mut impl BufMut) {
        self.chain_id.write(buf);
        self.nonce.write(buf);
        self.sender.write(buf);
        self.to.write(buf);
        self.value.write(buf);
        self.gas.write(buf);
        self.gas_price.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for Transaction {
    fn encode_size(&self) -> usize {
        8 * 5 + PublicKey::LEN + Address::LEN + 64
    }
}

impl Read for Transaction {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            chain_id: u64::read(reader)?,
            nonce: u64::read(reader)?,
            sender: PublicKey::read(reader)?,
            to: Address::read(reader)?,
            value: u64::read(reader)?,
            gas: u64::read(reader)?,
            gas_price: u64::read(reader)?,
            signature: <[u8; 64]>::read(reader)?,
        })
    }
}

/// Block header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub number: u64,
    pub parent: Hash,
    /// Seconds since the genesis timestamp.
    pub time: u64,
    pub beneficiary: Address,
    pub transactions_root: Hash,
}

impl Header {
    pub fn hash(&self) -> Hash {
        Hash::digest(&self.encode())
    }
}

impl Write for Header {
    fn write(&self, buf: &mut impl BufMut) {
        self.number.write(buf);
        self.parent.write(buf);
        self.time.write(buf);
        self.beneficiary.write(buf);
        self.transactions_root.write(buf);
    }
}

impl EncodeSize for Header {
    fn encode_size(&self) -> usize {
        8 + Hash::LEN + 8 + Address::LEN + Hash::LEN
    }
}

impl Read for Header {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            number: u64::read(reader)?,
            parent: Hash::read(reader)?,
            time: u64::read(reader)?,
            beneficiary: Address::read(reader)?,
            transactions_root: Hash::read(reader)?,
        })
    }
}

/// A header and the transactions it commits to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble a block, computing its transactions root.
    pub fn new(
        number: u64,
        parent: Hash,
        time: u64,
        beneficiary: Address,
        transactions: Vec<Transaction>,
    ) -> Self {
        let transactions_root = transactions_root(&transactions);
        Self {
            header: Header {
                number,
                parent,
                time,
                beneficiary,
                transactions_root,
            },
            transactions,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn transaction_hashes(&self) -> impl Iterator<Item = Hash> + '_ {
        self.transactions.iter().map(Transaction::hash)
    }

    /// Returns true if the header commits to the carried transactions.
    pub fn is_consistent(&self) -> bool {
        self.header.transactions_root == transactions_root(&self.transactions)
    }
}

fn transactions_root(transactions: &[Transaction]) -> Hash {
    let mut buf = Vec::with_capacity(transactions.len() * Hash::LEN);
    for tx in transactions {
        buf.extend_from_slice(tx.hash().as_bytes());
    }
    Hash::digest(&buf)
}

impl Write for Block {
    fn write(&self, buf: &mut impl BufMut) {
        self.header.write(buf);
        self.transactions.write(buf);
    }
}

impl EncodeSize for Block {
    fn encode_size(&self) -> usize {
        self.header.encode_size() + self.transactions.encode_size()
    }
}

impl Read for Block {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let header = Header::read(reader)?;
        let transactions = Vec::<Transaction>::read_range(reader, ..=MAX_BLOCK_TRANSACTIONS)?;
        let block = Self {
            header,
            transactions,
        };
        if !block.is_consistent() {
            return Err(CodecError::Invalid("Block", "transactions root mismatch"));
        }
        Ok(block)
    }
}

/// Outcome of an included transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub block: Hash,
    pub number: u64,
    pub gas_used: u64,
    pub fee: u64,
}

/// Snapshot of a node's synchronisation progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub current: u64,
    pub highest: u64,
}

impl SyncProgress {
    pub fn is_complete(&self) -> bool {
        self.current >= self.highest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::DecodeExt;
    use rand::{rngs::StdRng, SeedableRng};

    fn key(seed: u64) -> SigningKey {
        SigningKey::random(&mut StdRng::seed_from_u64(seed))
    }

    fn transfer(key: &SigningKey, nonce: u64) -> Transaction {
        UnsignedTransaction {
            chain_id: 1,
            nonce,
            to: Address([7u8; 20]),
            value: 100,
            gas: TRANSFER_GAS,
            gas_price: 10,
        }
        .sign(key)
    }

    #[test]
    fn test_signature_verifies() {
        let key = key(0);
        let tx = transfer(&key, 0);
        assert!(tx.verify());
        assert_eq!(tx.origin(), PublicKey::from(&key).address());
    }

    #[test]
    fn test_tampered_transaction_rejected() {
        let mut tx = transfer(&key(0), 0);
        tx.value += 1;
        assert!(!tx.verify());

        let mut tx = transfer(&key(0), 0);
        tx.sender = PublicKey::from(&key(1));
        assert!(!tx.verify());
    }

    #[test]
    fn test_hash_covers_nonce() {
        let key = key(3);
        assert_ne!(transfer(&key, 0).hash(), transfer(&key, 1).hash());
    }

    #[test]
    fn test_block_decode() {
        let key = key(2);
        let block = Block::new(
            4,
            Hash([1u8; 32]),
            4,
            Address([2u8; 20]),
            vec![transfer(&key, 0), transfer(&key, 1)],
        );
        let decoded = Block::decode(block.encode().freeze()).unwrap();
        assert_eq!(decoded.hash(), block.hash());
        assert_eq!(
            decoded.transaction_hashes().collect::<Vec<_>>(),
            block.transaction_hashes().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_block_transaction_limit() {
        let key = key(2);
        let mut block = Block::new(1, Hash::default(), 1, Address::default(), vec![]);
        block.transactions = vec![transfer(&key, 0); MAX_BLOCK_TRANSACTIONS + 1];
        block.header.transactions_root = transactions_root(&block.transactions);
        assert!(matches!(
            Block::decode(block.encode().freeze()),
            Err(CodecError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_block_with_forged_transactions_rejected() {
        let key = key(2);
        let mut block = Block::new(1, Hash::default(), 1, Address::default(), vec![]);
        block.transactions.push(transfer(&key, 0));
        assert!(!block.is_consistent());
        assert!(matches!(
            Block::decode(block.encode().freeze()),
            Err(CodecError::Invalid("Block", _))
        ));
    }
}
