//! Deterministic validator sets and the genesis they share.

use crate::types::{Address, Block, Hash, PublicKey};
use p256::ecdsa::SigningKey;
use rand::{rngs::StdRng, SeedableRng};

/// Default initial balance of a generated validator.
pub const DEFAULT_BALANCE: u64 = 1_000_000_000_000;

/// A validator's signing key and initial balance.
#[derive(Clone)]
pub struct Validator {
    pub key: SigningKey,
    pub balance: u64,
}

impl Validator {
    pub fn identity(&self) -> PublicKey {
        PublicKey::from(&self.key)
    }

    pub fn address(&self) -> Address {
        self.identity().address()
    }
}

/// Generate `count` validators whose keys are derived from `seed`.
pub fn validators(count: usize, seed: u64, balance: u64) -> Vec<Validator> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| Validator {
            key: SigningKey::random(&mut rng),
            balance,
        })
        .collect()
}

/// The public record of a validator in the genesis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub identity: PublicKey,
    pub address: Address,
    pub balance: u64,
}

/// Chain parameters every node of a cluster starts from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Genesis {
    pub chain_id: u64,

    /// Seconds between blocks.
    pub block_period: u64,

    /// Minimum gas price accepted into the transaction pool.
    pub min_gas_price: u64,

    /// Validators in proposer order.
    pub validators: Vec<Account>,
}

impl Genesis {
    pub fn new(chain_id: u64, block_period: u64, min_gas_price: u64, validators: &[Validator]) -> Self {
        Self {
            chain_id,
            block_period,
            min_gas_price,
            validators: validators
                .iter()
                .map(|validator| Account {
                    identity: validator.identity(),
                    address: validator.address(),
                    balance: validator.balance,
                })
                .collect(),
        }
    }

    /// The block at height zero.
    pub fn block(&self) -> Block {
        Block::new(0, Hash::default(), 0, Address::default(), Vec::new())
    }

    /// The validator expected to propose at `height` after `round` missed slots.
    ///
    /// Returns `None` if the validator set is empty.
    pub fn proposer(&self, height: u64, round: u64) -> Option<&Account> {
        if self.validators.is_empty() {
            return None;
        }
        let index = height.wrapping_add(round) % self.validators.len() as u64;
        self.validators.get(index as usize)
    }

    /// Seconds after the parent block at which `round` becomes due.
    pub fn round_offset(&self, round: u64) -> u64 {
        self.block_period
            .saturating_mul(1u64.saturating_add(round.saturating_mul(3)))
    }

    pub fn is_validator(&self, identity: &PublicKey) -> bool {
        self.validators.iter().any(|account| account.identity == *identity)
    }
}
