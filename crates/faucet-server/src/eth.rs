//! Transaction issuance against an Ethereum RPC gateway.
//!
//! Holds the faucet's single signing account, assigns nonces through an
//! atomic sequencer shared by all request handlers, and submits signed
//! legacy transactions. When the node rejects a submission because of a
//! stale or duplicate nonce, the sequencer is resynced from the node's
//! pending nonce; the failed transaction is not retried.

use crate::config::EthereumConfig;
use crate::error::{FaucetError, FaucetResult};
use alloy::{
    consensus::{SignableTransaction, TxEnvelope, TxLegacy},
    eips::eip2718::Encodable2718,
    network::TxSignerSync,
    primitives::{Address, Bytes, TxHash, TxKind, U256},
    providers::{Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol,
    sol_types::SolCall,
};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Gas limit for a plain value transfer.
const NATIVE_TRANSFER_GAS: u64 = 21_000;

sol! {
    function transfer(address to, uint256 amount) external returns (bool);
}

/// Which leg of a claim a transfer belongs to. Carried in errors so the
/// caller can tell the legs of a dual payout apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Native,
    Token,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Native => f.write_str("native"),
            TransferKind::Token => f.write_str("token"),
        }
    }
}

/// Ledger node capability consumed by the issuer.
///
/// Production uses [`RpcGateway`]; tests substitute an in-memory mock.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn chain_id(&self) -> FaucetResult<u64>;
    async fn suggest_gas_price(&self) -> FaucetResult<u128>;
    async fn pending_nonce(&self, address: Address) -> FaucetResult<u64>;
    async fn submit(&self, raw_tx: &[u8]) -> FaucetResult<()>;
}

/// Gateway backed by an alloy HTTP provider.
pub struct RpcGateway {
    provider: Box<dyn Provider>,
}

impl RpcGateway {
    pub fn connect(rpc_url: &str) -> FaucetResult<Self> {
        let url = url::Url::parse(rpc_url)
            .map_err(|e| FaucetError::Internal(anyhow::anyhow!("Invalid RPC URL: {}", e)))?;
        let provider = Box::new(ProviderBuilder::new().connect_http(url));
        Ok(Self { provider })
    }
}

#[async_trait]
impl Gateway for RpcGateway {
    async fn chain_id(&self) -> FaucetResult<u64> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| FaucetError::Gateway(format!("failed to query chain id: {}", e)))
    }

    async fn suggest_gas_price(&self) -> FaucetResult<u128> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| FaucetError::Gateway(format!("failed to query gas price: {}", e)))
    }

    async fn pending_nonce(&self, address: Address) -> FaucetResult<u64> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|e| FaucetError::Gateway(format!("failed to query pending nonce: {}", e)))
    }

    async fn submit(&self, raw_tx: &[u8]) -> FaucetResult<()> {
        self.provider
            .send_raw_transaction(raw_tx)
            .await
            .map(|_| ())
            .map_err(|e| FaucetError::Gateway(e.to_string()))
    }
}

/// Hands out unique, gap-free sequence numbers for the faucet account.
///
/// The counter only moves forward, except through [`resync`], which
/// overwrites it unconditionally with the gateway's view. Concurrent
/// `next` calls between a conflict and the resync can still collide;
/// that window is accepted.
///
/// [`resync`]: NonceSequencer::resync
#[derive(Debug, Default)]
pub struct NonceSequencer {
    next: AtomicU64,
}

impl NonceSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value and increments the counter atomically.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Overwrites the counter with an authoritative value.
    pub fn resync(&self, value: u64) {
        self.next.store(value, Ordering::SeqCst);
    }

    /// The value the next `next()` call will return.
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

/// Builds, signs and submits faucet transactions.
///
/// One instance per process; shared across all handlers. The only shared
/// mutation is the nonce increment, so two transfers can be in flight to
/// the gateway at once, each holding a distinct nonce. Submission order
/// is therefore not guaranteed to match nonce order; the node's pending
/// queue absorbs the gaps.
pub struct TxSender {
    gateway: Arc<dyn Gateway>,
    signer: PrivateKeySigner,
    sender: Address,
    chain_id: u64,
    token_address: Option<Address>,
    token_gas_limit: u64,
    nonce: NonceSequencer,
}

impl fmt::Debug for TxSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxSender")
            .field("sender", &self.sender)
            .field("chain_id", &self.chain_id)
            .field("token_address", &self.token_address)
            .field("nonce", &self.nonce)
            .finish()
    }
}

impl TxSender {
    /// Connect to the configured RPC endpoint and build the issuer.
    pub async fn new(config: &EthereumConfig) -> FaucetResult<Self> {
        let gateway: Arc<dyn Gateway> = Arc::new(RpcGateway::connect(&config.rpc_url)?);
        Self::with_gateway(config, gateway).await
    }

    /// Build the issuer on top of an existing gateway.
    ///
    /// Queries the chain id when the config leaves it unset; that query is
    /// the only fatal startup call. The initial nonce seed is best effort:
    /// on failure the counter stays at zero and the first conflict repairs
    /// it.
    pub async fn with_gateway(
        config: &EthereumConfig,
        gateway: Arc<dyn Gateway>,
    ) -> FaucetResult<Self> {
        let key = config
            .private_key
            .strip_prefix("0x")
            .unwrap_or(&config.private_key);
        let signer = PrivateKeySigner::from_str(key)
            .map_err(|e| FaucetError::Internal(anyhow::anyhow!("Invalid private key: {}", e)))?;
        let sender = signer.address();

        let chain_id = match config.chain_id {
            Some(id) => id,
            None => gateway.chain_id().await?,
        };

        let token_address = match &config.token_address {
            Some(addr) => Some(Self::validate_address(addr)?),
            None => None,
        };

        let nonce = NonceSequencer::new();
        match gateway.pending_nonce(sender).await {
            Ok(seed) => nonce.resync(seed),
            Err(e) => error!(address = %sender, error = %e, "failed to seed nonce from gateway"),
        }

        Ok(Self {
            gateway,
            signer,
            sender,
            chain_id,
            token_address,
            token_gas_limit: config.token_gas_limit,
            nonce,
        })
    }

    /// The faucet's own address.
    pub fn sender(&self) -> Address {
        self.sender
    }

    /// Cheap reachability check for the health endpoint.
    pub async fn gateway_reachable(&self) -> bool {
        self.gateway.pending_nonce(self.sender).await.is_ok()
    }

    #[cfg(test)]
    pub(crate) fn sequencer(&self) -> &NonceSequencer {
        &self.nonce
    }

    /// Send `amount` wei of the native asset to `to`.
    ///
    /// Returns the transaction hash on submission acceptance, not
    /// confirmation.
    pub async fn transfer_native(&self, to: &str, amount: U256) -> FaucetResult<TxHash> {
        let to = Self::validate_address(to)?;
        let gas_price = self
            .gateway
            .suggest_gas_price()
            .await
            .map_err(|e| transfer_error(TransferKind::Native, &e))?;

        let tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce: self.nonce.next(),
            gas_price,
            gas_limit: NATIVE_TRANSFER_GAS,
            to: TxKind::Call(to),
            value: amount,
            input: Bytes::new(),
        };

        self.sign_and_submit(TransferKind::Native, tx).await
    }

    /// Send `amount` of the configured ERC-20 token to `to`.
    ///
    /// Consumes its own nonce, independent of any native transfer in the
    /// same claim.
    pub async fn transfer_token(&self, to: &str, amount: U256) -> FaucetResult<TxHash> {
        let token = self.token_address.ok_or_else(|| FaucetError::Transfer {
            kind: TransferKind::Token,
            reason: "no token contract configured".to_string(),
        })?;
        let to = Self::validate_address(to)?;
        let gas_price = self
            .gateway
            .suggest_gas_price()
            .await
            .map_err(|e| transfer_error(TransferKind::Token, &e))?;

        let input = transferCall { to, amount }.abi_encode();
        let tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce: self.nonce.next(),
            gas_price,
            gas_limit: self.token_gas_limit,
            to: TxKind::Call(token),
            value: U256::ZERO,
            input: input.into(),
        };

        self.sign_and_submit(TransferKind::Token, tx).await
    }

    async fn sign_and_submit(&self, kind: TransferKind, mut tx: TxLegacy) -> FaucetResult<TxHash> {
        let signature = self
            .signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| FaucetError::Transfer {
                kind,
                reason: format!("signing failed: {}", e),
            })?;
        let signed = tx.into_signed(signature);
        let hash = *signed.hash();
        let raw = TxEnvelope::Legacy(signed).encoded_2718();

        if let Err(e) = self.gateway.submit(&raw).await {
            error!(%kind, tx_hash = %hash, error = %e, "failed to send transaction");
            let reason = e.to_string();
            if is_nonce_conflict(&reason) {
                self.resync_nonce().await;
            }
            return Err(FaucetError::Transfer { kind, reason });
        }

        Ok(hash)
    }

    /// Best-effort repair after a sequencing conflict: pull the node's
    /// authoritative pending nonce and overwrite the counter.
    async fn resync_nonce(&self) {
        match self.gateway.pending_nonce(self.sender).await {
            Ok(nonce) => {
                info!(nonce, "nonce sequencer resynced from gateway");
                self.nonce.resync(nonce);
            }
            Err(e) => error!(address = %self.sender, error = %e, "failed to resync nonce"),
        }
    }

    /// Parse a caller-supplied recipient into a checked address.
    pub fn validate_address(address: &str) -> FaucetResult<Address> {
        Address::from_str(address).map_err(|_| FaucetError::InvalidAddress(address.to_string()))
    }
}

/// Nodes phrase stale-nonce rejections differently; matching on the word
/// is the same heuristic the usual geth error texts satisfy.
fn is_nonce_conflict(message: &str) -> bool {
    message.contains("nonce")
}

fn transfer_error(kind: TransferKind, cause: &FaucetError) -> FaucetError {
    FaucetError::Transfer {
        kind,
        reason: cause.to_string(),
    }
}

/// Convert a configured ETH amount to wei.
pub fn eth_to_wei(eth_amount: f64) -> U256 {
    let wei = (eth_amount * 1e18) as u128;
    U256::from(wei)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EthereumConfig;
    use alloy::eips::eip2718::Decodable2718;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::thread;

    const TEST_KEY: &str = "abcd1234567890abcd1234567890abcd1234567890abcd1234567890abcd1234";
    const TEST_TOKEN: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    fn test_config() -> EthereumConfig {
        EthereumConfig {
            rpc_url: "http://localhost:8545".to_string(),
            private_key: TEST_KEY.to_string(),
            chain_id: Some(31337),
            token_address: Some(TEST_TOKEN.to_string()),
            token_gas_limit: 100_000,
            request_timeout_secs: 5,
        }
    }

    /// In-memory gateway recording every submitted envelope.
    struct MockGateway {
        pending: AtomicU64,
        gas_price: u128,
        submitted: Mutex<Vec<TxEnvelope>>,
        reject_with: Mutex<Option<String>>,
    }

    impl MockGateway {
        fn seeded(pending: u64) -> Self {
            Self {
                pending: AtomicU64::new(pending),
                gas_price: 1_000_000_000,
                submitted: Mutex::new(Vec::new()),
                reject_with: Mutex::new(None),
            }
        }

        fn reject_submissions(&self, message: &str) {
            *self.reject_with.lock().unwrap() = Some(message.to_string());
        }

        fn submitted_nonces(&self) -> Vec<u64> {
            self.submitted
                .lock()
                .unwrap()
                .iter()
                .map(|envelope| match envelope {
                    TxEnvelope::Legacy(signed) => signed.tx().nonce,
                    _ => panic!("faucet only issues legacy transactions"),
                })
                .collect()
        }
    }

    #[async_trait]
    impl Gateway for MockGateway {
        async fn chain_id(&self) -> FaucetResult<u64> {
            Ok(31337)
        }

        async fn suggest_gas_price(&self) -> FaucetResult<u128> {
            Ok(self.gas_price)
        }

        async fn pending_nonce(&self, _address: Address) -> FaucetResult<u64> {
            Ok(self.pending.load(Ordering::SeqCst))
        }

        async fn submit(&self, raw_tx: &[u8]) -> FaucetResult<()> {
            if let Some(message) = self.reject_with.lock().unwrap().clone() {
                return Err(FaucetError::Gateway(message));
            }
            let envelope = TxEnvelope::decode_2718(&mut &raw_tx[..])
                .expect("submitted bytes decode as a transaction envelope");
            self.submitted.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    async fn test_sender(gateway: Arc<MockGateway>) -> TxSender {
        TxSender::with_gateway(&test_config(), gateway)
            .await
            .unwrap()
    }

    #[test]
    fn sequencer_values_are_unique_and_gap_free_under_contention() {
        let sequencer = Arc::new(NonceSequencer::new());
        sequencer.resync(100);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sequencer = Arc::clone(&sequencer);
            handles.push(thread::spawn(move || {
                (0..50).map(|_| sequencer.next()).collect::<Vec<_>>()
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.extend(handle.join().unwrap());
        }

        seen.sort_unstable();
        let expected: Vec<u64> = (100..100 + 8 * 50).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn resync_then_next_returns_the_resynced_value() {
        let sequencer = NonceSequencer::new();
        sequencer.next();
        sequencer.next();

        sequencer.resync(7);
        assert_eq!(sequencer.next(), 7);
        assert_eq!(sequencer.next(), 8);
    }

    #[tokio::test]
    async fn sender_seeds_nonce_from_gateway() {
        let gateway = Arc::new(MockGateway::seeded(42));
        let sender = test_sender(gateway).await;
        assert_eq!(sender.sequencer().current(), 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_native_transfers_consume_sequential_nonces() {
        let gateway = Arc::new(MockGateway::seeded(7));
        let sender = Arc::new(test_sender(Arc::clone(&gateway)).await);

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let sender = Arc::clone(&sender);
            tasks.push(tokio::spawn(async move {
                sender
                    .transfer_native(
                        "0x742d35Cc6634C0532925a3b8D404cB8b3d3A5d3a",
                        U256::from(10u64.pow(18)),
                    )
                    .await
            }));
        }

        let mut hashes = HashSet::new();
        for task in tasks {
            let hash = task.await.unwrap().unwrap();
            hashes.insert(hash);
        }
        assert_eq!(hashes.len(), 3);

        let nonces: HashSet<u64> = gateway.submitted_nonces().into_iter().collect();
        assert_eq!(nonces, HashSet::from([7, 8, 9]));
    }

    #[tokio::test]
    async fn nonce_conflict_resyncs_from_authoritative_pending_nonce() {
        let gateway = Arc::new(MockGateway::seeded(7));
        let sender = test_sender(Arc::clone(&gateway)).await;

        gateway.reject_submissions("nonce too low");
        gateway.pending.store(42, Ordering::SeqCst);

        let err = sender
            .transfer_native(
                "0x742d35Cc6634C0532925a3b8D404cB8b3d3A5d3a",
                U256::from(1u64),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("native"));

        // The next assigned nonce is the gateway's view, not the old counter.
        assert_eq!(sender.sequencer().next(), 42);
    }

    #[tokio::test]
    async fn non_nonce_failure_leaves_the_counter_alone() {
        let gateway = Arc::new(MockGateway::seeded(7));
        let sender = test_sender(Arc::clone(&gateway)).await;

        gateway.reject_submissions("insufficient funds for transfer");

        let err = sender
            .transfer_native(
                "0x742d35Cc6634C0532925a3b8D404cB8b3d3A5d3a",
                U256::from(1u64),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("insufficient funds"));

        // Nonce 7 was consumed and is not returned to the pool.
        assert_eq!(sender.sequencer().current(), 8);
    }

    #[tokio::test]
    async fn token_transfer_targets_the_token_contract() {
        let gateway = Arc::new(MockGateway::seeded(0));
        let sender = test_sender(Arc::clone(&gateway)).await;

        sender
            .transfer_token(
                "0x742d35Cc6634C0532925a3b8D404cB8b3d3A5d3a",
                U256::from(5u64),
            )
            .await
            .unwrap();

        let submitted = gateway.submitted.lock().unwrap();
        let TxEnvelope::Legacy(signed) = &submitted[0] else {
            panic!("expected a legacy transaction");
        };
        let tx = signed.tx();
        assert_eq!(tx.to, TxKind::Call(TEST_TOKEN.parse().unwrap()));
        assert_eq!(tx.value, U256::ZERO);
        // transfer(address,uint256) selector
        assert_eq!(&tx.input[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[tokio::test]
    async fn token_transfer_without_configured_contract_fails() {
        let gateway = Arc::new(MockGateway::seeded(0));
        let mut config = test_config();
        config.token_address = None;
        let sender = TxSender::with_gateway(&config, gateway).await.unwrap();

        let err = sender
            .transfer_token(
                "0x742d35Cc6634C0532925a3b8D404cB8b3d3A5d3a",
                U256::from(1u64),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[tokio::test]
    async fn dual_payout_legs_consume_independent_nonces() {
        let gateway = Arc::new(MockGateway::seeded(3));
        let sender = test_sender(Arc::clone(&gateway)).await;
        let recipient = "0x742d35Cc6634C0532925a3b8D404cB8b3d3A5d3a";

        sender
            .transfer_native(recipient, U256::from(1u64))
            .await
            .unwrap();
        sender
            .transfer_token(recipient, U256::from(1u64))
            .await
            .unwrap();

        assert_eq!(gateway.submitted_nonces(), vec![3, 4]);
    }

    #[test]
    fn validate_address_accepts_checksummed_and_plain_hex() {
        for addr in [
            "0x742d35Cc6634C0532925a3b8D404cB8b3d3A5d3a",
            "0x742d35cc6634c0532925a3b8d404cb8b3d3a5d3a",
            "0x0000000000000000000000000000000000000000",
        ] {
            assert!(TxSender::validate_address(addr).is_ok());
        }
    }

    #[test]
    fn validate_address_rejects_malformed_input() {
        for addr in ["", "0x123", "not-an-address", "0xGGGG"] {
            assert!(TxSender::validate_address(addr).is_err());
        }
    }

    #[test]
    fn eth_to_wei_conversion() {
        assert_eq!(eth_to_wei(1.0), U256::from(10u64.pow(18)));
        assert_eq!(eth_to_wei(0.5), U256::from(5u64 * 10u64.pow(17)));
        assert_eq!(eth_to_wei(0.0), U256::ZERO);
    }

    #[test]
    fn nonce_conflict_detection_is_a_substring_match() {
        assert!(is_nonce_conflict("nonce too low"));
        assert!(is_nonce_conflict("replacement transaction underpriced: nonce 5"));
        assert!(!is_nonce_conflict("insufficient funds"));
    }
}
