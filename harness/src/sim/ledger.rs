//! Canonical chain, account state and transaction pool of a simulated node.

use super::Error;
use crate::{
    chain,
    genesis::Genesis,
    types::{Address, Block, Hash, Header, Receipt, Transaction, TRANSFER_GAS},
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

#[derive(Clone, Default)]
struct Accounts {
    balances: HashMap<Address, u64>,
    nonces: HashMap<Address, u64>,
}

impl Accounts {
    fn balance(&self, address: &Address) -> u64 {
        self.balances.get(address).copied().unwrap_or_default()
    }

    fn nonce(&self, address: &Address) -> u64 {
        self.nonces.get(address).copied().unwrap_or_default()
    }

    /// Apply a transfer, returning the fee paid to `beneficiary`.
    fn execute(&mut self, tx: &Transaction, beneficiary: &Address) -> Result<u64, chain::Error> {
        let origin = tx.origin();
        let expected = self.nonce(&origin);
        if tx.nonce < expected {
            return Err(chain::Error::NonceTooLow(tx.nonce, expected));
        }
        if tx.nonce > expected {
            return Err(chain::Error::NonceTooHigh(tx.nonce, expected));
        }
        let balance = self.balance(&origin);
        if balance < tx.cost() {
            return Err(chain::Error::InsufficientFunds(balance, tx.cost()));
        }

        let fee = TRANSFER_GAS.saturating_mul(tx.gas_price);
        self.balances
            .insert(origin, balance - tx.value.saturating_add(fee));
        let to = self.balance(&tx.to).saturating_add(tx.value);
        self.balances.insert(tx.to, to);
        let paid = self.balance(beneficiary).saturating_add(fee);
        self.balances.insert(*beneficiary, paid);
        self.nonces.insert(origin, expected + 1);
        Ok(fee)
    }
}

/// Chain and account state of one node.
pub struct Ledger {
    genesis: Genesis,
    max_block_transactions: usize,
    blocks: Vec<Arc<Block>>,
    index: HashMap<Hash, u64>,
    accounts: Accounts,
    receipts: HashMap<Hash, Receipt>,
    pool: BTreeMap<(Address, u64), Transaction>,
}

impl Ledger {
    pub fn new(genesis: Genesis, max_block_transactions: usize) -> Self {
        let block = Arc::new(genesis.block());
        let mut accounts = Accounts::default();
        for account in &genesis.validators {
            accounts.balances.insert(account.address, account.balance);
        }
        let mut index = HashMap::new();
        index.insert(block.hash(), 0);
        Self {
            genesis,
            max_block_transactions,
            blocks: vec![block],
            index,
            accounts,
            receipts: HashMap::new(),
            pool: BTreeMap::new(),
        }
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    pub fn head(&self) -> &Arc<Block> {
        // The genesis block is never removed.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn height(&self) -> u64 {
        self.head().number()
    }

    pub fn block(&self, number: u64) -> Option<&Arc<Block>> {
        self.blocks.get(usize::try_from(number).ok()?)
    }

    /// Up to `limit` canonical blocks starting at `from`.
    pub fn blocks_from(&self, from: u64, limit: usize) -> Vec<Block> {
        let Ok(from) = usize::try_from(from) else {
            return Vec::new();
        };
        self.blocks
            .iter()
            .skip(from)
            .take(limit)
            .map(|block| block.as_ref().clone())
            .collect()
    }

    pub fn header_by_hash(&self, hash: &Hash) -> Option<Header> {
        let number = self.index.get(hash)?;
        self.block(*number).map(|block| block.header.clone())
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<&Arc<Block>> {
        let number = self.index.get(hash)?;
        self.block(*number)
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.accounts.balance(address)
    }

    /// Next nonce for `address`, counting pooled transactions.
    pub fn pending_nonce(&self, address: &Address) -> u64 {
        let confirmed = self.accounts.nonce(address);
        self.pool
            .range((*address, confirmed)..=(*address, u64::MAX))
            .map(|((_, nonce), _)| nonce + 1)
            .last()
            .unwrap_or(confirmed)
    }

    pub fn receipt(&self, hash: &Hash) -> Option<Receipt> {
        self.receipts.get(hash).cloned()
    }

    /// Up to `limit` pooled transactions, ordered by sender and nonce.
    pub fn pooled(&self, limit: usize) -> Vec<Transaction> {
        self.pool.values().take(limit).cloned().collect()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Admit `tx` into the pool.
    ///
    /// Returns `Ok(false)` if the transaction is already pooled or included.
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<bool, chain::Error> {
        if tx.chain_id != self.genesis.chain_id {
            return Err(chain::Error::WrongChain(tx.chain_id));
        }
        if tx.gas < TRANSFER_GAS {
            return Err(chain::Error::IntrinsicGas(tx.gas, TRANSFER_GAS));
        }
        if tx.gas_price < self.genesis.min_gas_price {
            return Err(chain::Error::Underpriced(
                tx.gas_price,
                self.genesis.min_gas_price,
            ));
        }
        if !tx.verify() {
            return Err(chain::Error::InvalidSignature);
        }
        let hash = tx.hash();
        if self.receipts.contains_key(&hash) {
            return Ok(false);
        }
        let origin = tx.origin();
        let confirmed = self.accounts.nonce(&origin);
        if tx.nonce < confirmed {
            return Err(chain::Error::NonceTooLow(tx.nonce, confirmed));
        }
        let balance = self.accounts.balance(&origin);
        if balance < tx.cost() {
            return Err(chain::Error::InsufficientFunds(balance, tx.cost()));
        }
        if self.pool.contains_key(&(origin, tx.nonce)) {
            return Ok(false);
        }
        self.pool.insert((origin, tx.nonce), tx);
        Ok(true)
    }

    /// Assemble a block on top of the head from executable pooled transactions.
    pub fn build(&self, beneficiary: Address, time: u64) -> Block {
        let mut accounts = self.accounts.clone();
        let mut transactions = Vec::new();
        for tx in self.pool.values() {
            if transactions.len() >= self.max_block_transactions {
                break;
            }
            if accounts.execute(tx, &beneficiary).is_ok() {
                transactions.push(tx.clone());
            }
        }
        let head = self.head();
        Block::new(head.number() + 1, head.hash(), time, beneficiary, transactions)
    }

    /// Round at which a block `delta` seconds after its parent was proposed.
    fn round(&self, delta: u64) -> Option<u64> {
        let period = self.genesis.block_period.max(1);
        if delta == 0 || delta % period != 0 {
            return None;
        }
        let slots = delta / period - 1;
        if slots % 3 != 0 {
            return None;
        }
        Some(slots / 3)
    }

    /// Validate and append `block` to the canonical chain.
    pub fn import(&mut self, block: Block) -> Result<Arc<Block>, Error> {
        let head = self.head();
        let number = block.number();
        if number != head.number() + 1 {
            return Err(Error::UnexpectedNumber(number, head.number()));
        }
        if block.header.parent != head.hash() {
            return Err(Error::UnknownParent(block.header.parent));
        }
        if !block.is_consistent() {
            return Err(Error::InconsistentBlock);
        }
        if block.transactions.len() > self.max_block_transactions {
            return Err(Error::TooManyTransactions(block.transactions.len()));
        }
        let delta = block.header.time.saturating_sub(head.header.time);
        let round = self
            .round(delta)
            .ok_or(Error::InvalidTime(block.header.time))?;
        let beneficiary = block.header.beneficiary;
        let expected = self
            .genesis
            .proposer(number, round)
            .map(|account| account.address);
        if expected != Some(beneficiary) {
            return Err(Error::UnexpectedProposer(beneficiary));
        }

        let mut accounts = self.accounts.clone();
        let mut receipts = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            let hash = tx.hash();
            let fee = accounts
                .execute(tx, &beneficiary)
                .map_err(|err| Error::InvalidTransaction(hash, err))?;
            receipts.push((hash, fee));
        }

        let block = Arc::new(block);
        let hash = block.hash();
        for (tx, fee) in receipts {
            self.receipts.insert(
                tx,
                Receipt {
                    block: hash,
                    number,
                    gas_used: TRANSFER_GAS,
                    fee,
                },
            );
        }
        self.accounts = accounts;
        let accounts = &self.accounts;
        self.pool
            .retain(|(origin, nonce), _| *nonce >= accounts.nonce(origin));
        self.index.insert(hash, number);
        self.blocks.push(block.clone());
        Ok(block)
    }

    /// Drop every block above `height` and rebuild state from the remaining chain.
    ///
    /// Transactions of the dropped blocks return to the pool where still valid.
    pub fn rewind(&mut self, height: u64) -> Result<(), Error> {
        if height >= self.height() {
            return Ok(());
        }
        let keep = usize::try_from(height).map_err(|_| Error::UnexpectedNumber(height, 0))?;
        let blocks = std::mem::take(&mut self.blocks);
        let pool = std::mem::take(&mut self.pool);
        *self = Self::new(self.genesis.clone(), self.max_block_transactions);
        let mut dropped = Vec::new();
        for (number, block) in blocks.into_iter().enumerate().skip(1) {
            if number <= keep {
                self.import(block.as_ref().clone())?;
            } else {
                dropped.extend(block.transactions.iter().cloned());
            }
        }
        for tx in dropped.into_iter().chain(pool.into_values()) {
            let _ = self.add_transaction(tx);
        }
        Ok(())
    }
}
