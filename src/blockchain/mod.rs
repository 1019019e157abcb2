//! Blockchain gateway used to pay out cashback.
//!
//! The gateway is an untrusted collaborator: any call may fail or hang, so every call site
//! goes through [`bounded`] and treats a timeout like any other failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::errors::ServiceError;

/// Networks the gateway can settle on.
pub const SUPPORTED_NETWORKS: [&str; 5] = ["polygon", "ethereum", "bsc", "arbitrum", "base"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BlockchainError {
    #[error("transfer rejected: {0}")]
    Rejected(String),
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),
}

impl From<BlockchainError> for ServiceError {
    fn from(err: BlockchainError) -> Self {
        ServiceError::ExternalServiceError(err.to_string())
    }
}

/// Outcome of a submitted cashback transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub tx_hash: String,
    pub block_number: Option<i64>,
    pub gas_used: Option<String>,
    pub gas_fee: Option<Decimal>,
}

/// On-chain status of a previously submitted transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionVerification {
    pub tx_hash: String,
    pub network: String,
    pub confirmed: bool,
    pub block_number: Option<i64>,
    pub confirmations: u64,
    pub checked_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockchainGateway: Send + Sync {
    /// Transfers `amount` to `wallet_address` on `network`.
    async fn send_cashback(
        &self,
        wallet_address: &str,
        amount: Decimal,
        network: &str,
    ) -> Result<TransferReceipt, BlockchainError>;

    async fn verify_transaction(
        &self,
        tx_hash: &str,
        network: &str,
    ) -> Result<TransactionVerification, BlockchainError>;
}

/// Runs a gateway call under `timeout`.
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, BlockchainError>
where
    F: Future<Output = Result<T, BlockchainError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            metrics::counter!("stateset_blockchain.timeouts", 1);
            Err(BlockchainError::Timeout(timeout))
        }
    }
}

/// A transfer accepted by the simulated chain.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedTransfer {
    pub wallet_address: String,
    pub amount: Decimal,
    pub network: String,
    pub block_number: i64,
}

#[derive(Debug, Default)]
struct SimulatedChain {
    height: i64,
    transfers: HashMap<String, SimulatedTransfer>,
    failures_remaining: u32,
    failure_message: String,
    latency: Duration,
}

/// In-process gateway for development and tests. Transfers succeed unless a failure is injected.
#[derive(Debug)]
pub struct SimulatedBlockchainGateway {
    chain: Mutex<SimulatedChain>,
}

impl Default for SimulatedBlockchainGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBlockchainGateway {
    pub fn new() -> Self {
        Self {
            chain: Mutex::new(SimulatedChain {
                height: 100_000,
                ..Default::default()
            }),
        }
    }

    /// Delays every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        if let Ok(mut chain) = self.chain.lock() {
            chain.latency = latency;
        }
        self
    }

    /// Makes the next `count` transfers fail with `message`.
    pub fn fail_next(&self, count: u32, message: &str) {
        if let Ok(mut chain) = self.chain.lock() {
            chain.failures_remaining = count;
            chain.failure_message = message.to_string();
        }
    }

    /// Every transfer the chain has accepted, keyed by transaction hash.
    pub fn transfers(&self) -> HashMap<String, SimulatedTransfer> {
        self.chain
            .lock()
            .map(|chain| chain.transfers.clone())
            .unwrap_or_default()
    }

    pub fn transfer_count(&self) -> usize {
        self.chain.lock().map(|c| c.transfers.len()).unwrap_or(0)
    }

    fn latency(&self) -> Duration {
        self.chain.lock().map(|c| c.latency).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimulatedChain>, BlockchainError> {
        self.chain
            .lock()
            .map_err(|_| BlockchainError::Unavailable("simulated chain poisoned".to_string()))
    }

    fn generate_tx_hash() -> String {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        format!("0x{}", hex)
    }
}

fn check_network(network: &str) -> Result<(), BlockchainError> {
    if SUPPORTED_NETWORKS.contains(&network) {
        Ok(())
    } else {
        Err(BlockchainError::UnsupportedNetwork(network.to_string()))
    }
}

fn check_address(address: &str) -> Result<(), BlockchainError> {
    let hex = address.strip_prefix("0x").unwrap_or("");
    if hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(BlockchainError::Rejected(format!(
            "invalid wallet address {}",
            address
        )))
    }
}

#[async_trait]
impl BlockchainGateway for SimulatedBlockchainGateway {
    #[instrument(skip(self))]
    async fn send_cashback(
        &self,
        wallet_address: &str,
        amount: Decimal,
        network: &str,
    ) -> Result<TransferReceipt, BlockchainError> {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        check_network(network)?;
        check_address(wallet_address)?;
        if amount <= Decimal::ZERO {
            return Err(BlockchainError::Rejected("amount must be positive".into()));
        }

        let mut chain = self.lock()?;
        if chain.failures_remaining > 0 {
            chain.failures_remaining -= 1;
            warn!(network, "Simulated transfer failure injected");
            return Err(BlockchainError::Unavailable(chain.failure_message.clone()));
        }

        chain.height += 1;
        let block_number = chain.height;
        let tx_hash = Self::generate_tx_hash();
        chain.transfers.insert(
            tx_hash.clone(),
            SimulatedTransfer {
                wallet_address: wallet_address.to_string(),
                amount,
                network: network.to_string(),
                block_number,
            },
        );

        info!(tx_hash = %tx_hash, block_number, "Simulated cashback transfer mined");

        Ok(TransferReceipt {
            tx_hash,
            block_number: Some(block_number),
            gas_used: Some("21000".to_string()),
            gas_fee: Some(Decimal::new(21, 6)),
        })
    }

    #[instrument(skip(self))]
    async fn verify_transaction(
        &self,
        tx_hash: &str,
        network: &str,
    ) -> Result<TransactionVerification, BlockchainError> {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        check_network(network)?;

        let chain = self.lock()?;
        let mined = chain
            .transfers
            .get(tx_hash)
            .filter(|t| t.network == network)
            .map(|t| t.block_number);

        Ok(TransactionVerification {
            tx_hash: tx_hash.to_string(),
            network: network.to_string(),
            confirmed: mined.is_some(),
            block_number: mined,
            confirmations: mined
                .map(|block| (chain.height - block + 1).max(0) as u64)
                .unwrap_or(0),
            checked_at: Utc::now(),
        })
    }
}
