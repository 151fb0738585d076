//! Ledger client.
//!
//! Balance and existence checks go straight to Horizon's REST API; payments
//! are a single native-asset payment operation, built with `stellar-xdr`,
//! signed over the network-scoped payload hash, and submitted as a
//! base64 envelope. The engine only sees the [`Ledger`] trait.

use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey};
use log::debug;
use sha2::{Digest, Sha256};
use stellar_xdr::curr::{
    Asset, DecoratedSignature, Hash, Limits, Memo, MuxedAccount, Operation, OperationBody,
    PaymentOp, Preconditions, SequenceNumber, Signature, SignatureHint, StringM, Transaction,
    TransactionEnvelope, TransactionExt, TransactionSignaturePayload,
    TransactionSignaturePayloadTaggedTransaction, TransactionV1Envelope, Uint256, WriteXdr,
};

use crate::{
    config::StellarNetwork,
    error::{Error, Result},
    models::STROOPS_PER_XLM,
};

/// Largest memo the ledger accepts.
pub const MAX_MEMO_BYTES: usize = 28;

/// Base fee per operation, in stroops.
const BASE_FEE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub tx_hash: String,
    pub ledger_seq: i64,
    pub fee_charged: i64,
}

#[axum::async_trait]
pub trait Ledger: Send + Sync {
    async fn account_exists(&self, address: &str) -> Result<bool>;
    async fn balance_stroops(&self, address: &str) -> Result<i64>;
    /// Submit a signed native-asset payment. `memo` must be at most 28 bytes.
    async fn send_payment(
        &self,
        sender_secret: &str,
        recipient: &str,
        amount_stroops: i64,
        memo: &str,
    ) -> Result<PaymentReceipt>;
}

/// Parse a decimal XLM string ("50", "12.5") into stroops.
pub fn xlm_to_stroops(s: &str) -> Result<i64> {
    let invalid = || Error::Validation {
        field: "amount",
        reason: format!("not a valid XLM amount: {s}"),
    };
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() || frac.len() > 7 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let whole: i64 = whole.parse().map_err(|_| invalid())?;
    if whole < 0 {
        return Err(invalid());
    }
    let frac_stroops = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<7}");
        padded.parse::<i64>().map_err(|_| invalid())?
    };
    whole
        .checked_mul(STROOPS_PER_XLM)
        .and_then(|w| w.checked_add(frac_stroops))
        .ok_or_else(invalid)
}

/// Parse a Horizon balance string into stroops.
fn balance_to_stroops(s: &str) -> Result<i64> {
    xlm_to_stroops(s).map_err(|_| Error::Ledger(format!("unparseable balance: {s}")))
}

pub struct HorizonClient {
    reqwest: reqwest::Client,
    base_url: String,
    network: StellarNetwork,
}

impl HorizonClient {
    pub fn new(base_url: impl Into<String>, network: StellarNetwork) -> HorizonClient {
        // transaction finality can take a few ledger closes
        let reqwest = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client builds with static config");
        HorizonClient {
            reqwest,
            base_url: base_url.into(),
            network,
        }
    }

    async fn get_account(&self, address: &str) -> Result<Option<serde_json::Value>> {
        let url = format!("{}/accounts/{address}", self.base_url);
        let res = self
            .reqwest
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Ledger(e.to_string()))?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(Error::Ledger(format!(
                "horizon account lookup failed: {}",
                res.status()
            )));
        }
        let body = res
            .json::<serde_json::Value>()
            .await
            .map_err(|e| Error::Ledger(e.to_string()))?;
        Ok(Some(body))
    }

    fn network_id(&self) -> Hash {
        let digest = Sha256::digest(self.network.passphrase().as_bytes());
        Hash(digest.into())
    }
}

/// Build and sign a payment envelope. Split out of the client so it can be
/// exercised without a Horizon server.
pub fn build_payment_envelope(
    network_id: Hash,
    sender_secret: &str,
    recipient: &str,
    amount_stroops: i64,
    memo: &str,
    sequence: i64,
) -> Result<(String, String)> {
    if memo.len() > MAX_MEMO_BYTES {
        return Err(Error::Validation {
            field: "memo",
            reason: format!("memo exceeds {MAX_MEMO_BYTES} bytes"),
        });
    }

    let seed = stellar_strkey::ed25519::PrivateKey::from_string(sender_secret)
        .map_err(|_| Error::Ledger("invalid sender secret key".into()))?;
    let signing_key = SigningKey::from_bytes(&seed.0);
    let sender_public = signing_key.verifying_key().to_bytes();

    let destination = stellar_strkey::ed25519::PublicKey::from_string(recipient)
        .map_err(|_| Error::RecipientUnresolvable(recipient.to_string()))?;

    let memo_text: StringM<28> = memo
        .try_into()
        .map_err(|_| Error::Ledger("memo rejected by xdr".into()))?;

    let payment = PaymentOp {
        destination: MuxedAccount::Ed25519(Uint256(destination.0)),
        asset: Asset::Native,
        amount: amount_stroops,
    };
    let operation = Operation {
        source_account: None,
        body: OperationBody::Payment(payment),
    };
    let tx = Transaction {
        source_account: MuxedAccount::Ed25519(Uint256(sender_public)),
        fee: BASE_FEE,
        seq_num: SequenceNumber(sequence),
        cond: Preconditions::None,
        memo: Memo::Text(memo_text),
        operations: vec![operation]
            .try_into()
            .map_err(|_| Error::Ledger("operation list rejected by xdr".into()))?,
        ext: TransactionExt::V0,
    };

    let payload = TransactionSignaturePayload {
        network_id,
        tagged_transaction: TransactionSignaturePayloadTaggedTransaction::Tx(tx.clone()),
    };
    let payload_xdr = payload
        .to_xdr(Limits::none())
        .map_err(|e| Error::Ledger(format!("xdr encode failed: {e}")))?;
    let tx_hash = Sha256::digest(&payload_xdr);
    let signature = signing_key.sign(&tx_hash);

    let decorated = DecoratedSignature {
        hint: SignatureHint([
            sender_public[28],
            sender_public[29],
            sender_public[30],
            sender_public[31],
        ]),
        signature: Signature(
            signature
                .to_bytes()
                .to_vec()
                .try_into()
                .map_err(|_| Error::Ledger("signature rejected by xdr".into()))?,
        ),
    };

    let envelope = TransactionEnvelope::Tx(TransactionV1Envelope {
        tx,
        signatures: vec![decorated]
            .try_into()
            .map_err(|_| Error::Ledger("signature list rejected by xdr".into()))?,
    });
    let envelope_b64 = envelope
        .to_xdr_base64(Limits::none())
        .map_err(|e| Error::Ledger(format!("xdr encode failed: {e}")))?;

    Ok((envelope_b64, hex::encode(tx_hash)))
}

#[axum::async_trait]
impl Ledger for HorizonClient {
    async fn account_exists(&self, address: &str) -> Result<bool> {
        Ok(self.get_account(address).await?.is_some())
    }

    async fn balance_stroops(&self, address: &str) -> Result<i64> {
        let Some(account) = self.get_account(address).await? else {
            return Err(Error::RecipientUnresolvable(address.to_string()));
        };
        let balances = account["balances"]
            .as_array()
            .ok_or_else(|| Error::Ledger("account has no balances field".into()))?;
        for balance in balances {
            if balance["asset_type"].as_str() == Some("native") {
                let amount = balance["balance"]
                    .as_str()
                    .ok_or_else(|| Error::Ledger("balance is not a string".into()))?;
                return balance_to_stroops(amount);
            }
        }
        Ok(0)
    }

    async fn send_payment(
        &self,
        sender_secret: &str,
        recipient: &str,
        amount_stroops: i64,
        memo: &str,
    ) -> Result<PaymentReceipt> {
        let seed = stellar_strkey::ed25519::PrivateKey::from_string(sender_secret)
            .map_err(|_| Error::Ledger("invalid sender secret key".into()))?;
        let signing_key = SigningKey::from_bytes(&seed.0);
        let sender_address = stellar_strkey::ed25519::PublicKey(
            signing_key.verifying_key().to_bytes(),
        )
        .to_string();

        let account = self
            .get_account(&sender_address)
            .await?
            .ok_or_else(|| Error::Ledger(format!("sender account not found: {sender_address}")))?;
        let sequence: i64 = account["sequence"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Ledger("account has no sequence".into()))?;

        let (envelope_b64, _local_hash) = build_payment_envelope(
            self.network_id(),
            sender_secret,
            recipient,
            amount_stroops,
            memo,
            sequence + 1,
        )?;

        debug!("submitting payment of {amount_stroops} stroops to {recipient}");

        let res = self
            .reqwest
            .post(format!("{}/transactions", self.base_url))
            .form(&[("tx", envelope_b64)])
            .send()
            .await
            .map_err(|e| Error::Ledger(e.to_string()))?;
        let status = res.status();
        let body = res
            .json::<serde_json::Value>()
            .await
            .map_err(|e| Error::Ledger(e.to_string()))?;
        if !status.is_success() {
            let detail = body["extras"]["result_codes"]
                .to_string();
            return Err(Error::Ledger(format!(
                "transaction submission failed ({status}): {detail}"
            )));
        }

        let tx_hash = body["hash"]
            .as_str()
            .ok_or_else(|| Error::Ledger("horizon response missing hash".into()))?
            .to_string();
        let ledger_seq = body["ledger"].as_i64().unwrap_or_default();
        let fee_charged = match &body["fee_charged"] {
            serde_json::Value::String(s) => s.parse().unwrap_or_default(),
            serde_json::Value::Number(n) => n.as_i64().unwrap_or_default(),
            _ => 0,
        };
        Ok(PaymentReceipt {
            tx_hash,
            ledger_seq,
            fee_charged,
        })
    }
}

#[cfg(test)]
pub use mock::MockLedger;

#[cfg(test)]
mod mock {
    use std::{
        collections::HashMap,
        sync::Mutex,
    };

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentPayment {
        pub recipient: String,
        pub amount_stroops: i64,
        pub memo: String,
    }

    /// Scripted ledger for engine tests. Accounts must be added explicitly;
    /// everything else resolves as nonexistent.
    pub struct MockLedger {
        accounts: Mutex<HashMap<String, i64>>,
        pub sent: Mutex<Vec<SentPayment>>,
        pub fail_send: bool,
        counter: Mutex<u64>,
    }

    impl MockLedger {
        pub fn new() -> MockLedger {
            MockLedger {
                accounts: Mutex::new(HashMap::new()),
                sent: Mutex::new(vec![]),
                fail_send: false,
                counter: Mutex::new(0),
            }
        }

        pub fn with_account(self, address: &str, balance_stroops: i64) -> MockLedger {
            self.accounts
                .lock()
                .unwrap()
                .insert(address.to_string(), balance_stroops);
            self
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[axum::async_trait]
    impl Ledger for MockLedger {
        async fn account_exists(&self, address: &str) -> Result<bool> {
            Ok(self.accounts.lock().unwrap().contains_key(address))
        }

        async fn balance_stroops(&self, address: &str) -> Result<i64> {
            self.accounts
                .lock()
                .unwrap()
                .get(address)
                .copied()
                .ok_or_else(|| Error::RecipientUnresolvable(address.to_string()))
        }

        async fn send_payment(
            &self,
            _sender_secret: &str,
            recipient: &str,
            amount_stroops: i64,
            memo: &str,
        ) -> Result<PaymentReceipt> {
            if memo.len() > MAX_MEMO_BYTES {
                return Err(Error::Validation {
                    field: "memo",
                    reason: format!("memo exceeds {MAX_MEMO_BYTES} bytes"),
                });
            }
            if self.fail_send {
                return Err(Error::Ledger("scripted network failure".into()));
            }
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            let receipt = PaymentReceipt {
                tx_hash: format!("{:064x}", *counter),
                ledger_seq: *counter as i64,
                fee_charged: 100,
            };
            self.sent.lock().unwrap().push(SentPayment {
                recipient: recipient.to_string(),
                amount_stroops,
                memo: memo.to_string(),
            });
            Ok(receipt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xlm_parsing() {
        assert_eq!(xlm_to_stroops("50").unwrap(), 500_000_000);
        assert_eq!(xlm_to_stroops("12.5").unwrap(), 125_000_000);
        assert_eq!(xlm_to_stroops("0.0000001").unwrap(), 1);
        assert_eq!(xlm_to_stroops("0").unwrap(), 0);
        assert!(xlm_to_stroops("-1").is_err());
        assert!(xlm_to_stroops("1.00000001").is_err());
        assert!(xlm_to_stroops("abc").is_err());
        assert!(xlm_to_stroops("").is_err());
    }

    #[test]
    fn strkey_round_trip() {
        let seed_bytes = [7u8; 32];
        let seed = stellar_strkey::ed25519::PrivateKey(seed_bytes).to_string();
        let decoded = stellar_strkey::ed25519::PrivateKey::from_string(&seed).unwrap();
        assert_eq!(decoded.0, seed_bytes);
    }

    #[test]
    fn envelope_builds_and_signs() {
        let seed = stellar_strkey::ed25519::PrivateKey([7u8; 32]).to_string();
        let signing_key = SigningKey::from_bytes(&[9u8; 32]);
        let recipient =
            stellar_strkey::ed25519::PublicKey(signing_key.verifying_key().to_bytes()).to_string();

        let network_id = Hash(Sha256::digest("Test SDF Network ; September 2015".as_bytes()).into());
        let (envelope_b64, tx_hash) =
            build_payment_envelope(network_id, &seed, &recipient, 1_000_000, "bounty:abc", 42)
                .unwrap();
        assert!(!envelope_b64.is_empty());
        assert_eq!(tx_hash.len(), 64);
    }

    #[test]
    fn envelope_rejects_long_memo() {
        let seed = stellar_strkey::ed25519::PrivateKey([7u8; 32]).to_string();
        let network_id = Hash([0u8; 32]);
        let err = build_payment_envelope(
            network_id,
            &seed,
            "GAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAWHF",
            1,
            "this memo is way too long to fit in a stellar memo",
            1,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
