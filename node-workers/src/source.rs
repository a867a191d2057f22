//! Node transaction sources
//!
//! A [`NodeTransactionSource`] hands out ordered batches of committed
//! transactions from one full node. [`HttpTransactionSource`] talks to the
//! node's core API over JSON.

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_ledger_core::accumulator::{Hash32, HASH_LENGTH};
use gateway_ledger_core::amount::NAN_TOKEN;
use gateway_ledger_core::{
    CommittedTransaction, OperationGroup, StateVersion, SubstateContent, SubstateId,
    SubstateOperation, TokenAmount,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Source of committed transactions from a single node
#[async_trait]
pub trait NodeTransactionSource: Send + Sync {
    /// Network the node reports it is on
    async fn network_identity(&self) -> Result<String>;

    /// Up to `max_count` transactions following `after`, in state version order
    async fn fetch(
        &self,
        after: StateVersion,
        max_count: usize,
    ) -> Result<Vec<CommittedTransaction>>;
}

#[derive(Debug, Serialize)]
struct NetworkConfigurationRequest {}

#[derive(Debug, Deserialize)]
struct NetworkConfigurationResponse {
    network: String,
}

#[derive(Debug, Serialize)]
struct TransactionsRequest<'a> {
    network: &'a str,
    from_state_version: StateVersion,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    transactions: Vec<TransactionDto>,
}

#[derive(Debug, Deserialize)]
struct TransactionDto {
    state_version: StateVersion,
    parent_state_version: StateVersion,
    transaction_identifier: String,
    accumulator: String,
    #[serde(default)]
    payload: Option<String>,
    fee_paid: String,
    #[serde(default)]
    round_in_epoch: u64,
    #[serde(default)]
    ends_epoch: bool,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    operation_groups: Vec<OperationGroupDto>,
}

#[derive(Debug, Deserialize)]
struct OperationGroupDto {
    operations: Vec<OperationDto>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OperationDto {
    Up {
        substate_id: String,
        content: ContentDto,
    },
    Down {
        substate_id: String,
        content: ContentDto,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ContentDto {
    ResourceBalance {
        owner: String,
        resource: String,
        amount: String,
    },
    ValidatorStake {
        validator: String,
        owner: String,
        amount: String,
    },
    Data {
        data: String,
    },
}

/// Core API client for one node
#[derive(Debug, Clone)]
pub struct HttpTransactionSource {
    node_name: String,
    base_url: String,
    network: String,
    client: Client,
}

impl HttpTransactionSource {
    /// Create a client for `base_url`, requesting transactions of `network`
    pub fn new(
        node_name: impl Into<String>,
        base_url: impl Into<String>,
        network: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            node_name: node_name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            network: network.into(),
            client,
        })
    }

    fn api_error(&self, reason: impl Into<String>) -> Error {
        Error::NodeApi {
            node: self.node_name.clone(),
            reason: reason.into(),
        }
    }

    async fn post<Req, Resp>(&self, endpoint: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self.client.post(&url).json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.api_error(format!("{} returned {}: {}", endpoint, status, body)));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| self.api_error(format!("Failed to parse {} response: {}", endpoint, e)))
    }

    fn decode_hash(&self, field: &str, value: &str) -> Result<Hash32> {
        let bytes = self.decode_hex(field, value)?;
        bytes.as_slice().try_into().map_err(|_| {
            self.api_error(format!(
                "{} must be {} bytes, got {}",
                field,
                HASH_LENGTH,
                bytes.len()
            ))
        })
    }

    fn decode_hex(&self, field: &str, value: &str) -> Result<Vec<u8>> {
        hex::decode(value).map_err(|e| self.api_error(format!("{} is not hex: {}", field, e)))
    }

    // Malformed amounts become NaN rather than failing the batch
    fn parse_amount(&self, field: &str, value: &str) -> TokenAmount {
        let amount = TokenAmount::from_decimal_str(value);
        if amount.is_nan() && value != NAN_TOKEN {
            warn!(node = %self.node_name, field, value, "Amount is not decimal, ingesting as NaN");
        }
        amount
    }

    fn map_content(&self, dto: ContentDto) -> Result<SubstateContent> {
        Ok(match dto {
            ContentDto::ResourceBalance {
                owner,
                resource,
                amount,
            } => SubstateContent::ResourceBalance {
                owner,
                resource,
                amount: self.parse_amount("amount", &amount),
            },
            ContentDto::ValidatorStake {
                validator,
                owner,
                amount,
            } => SubstateContent::ValidatorStake {
                validator,
                owner,
                amount: self.parse_amount("amount", &amount),
            },
            ContentDto::Data { data } => SubstateContent::Data(self.decode_hex("data", &data)?),
        })
    }

    fn map_operation(&self, dto: OperationDto) -> Result<SubstateOperation> {
        Ok(match dto {
            OperationDto::Up {
                substate_id,
                content,
            } => SubstateOperation::Up {
                identifier: SubstateId::new(self.decode_hex("substate_id", &substate_id)?),
                content: self.map_content(content)?,
            },
            OperationDto::Down {
                substate_id,
                content,
            } => SubstateOperation::Down {
                identifier: SubstateId::new(self.decode_hex("substate_id", &substate_id)?),
                content: self.map_content(content)?,
            },
        })
    }

    fn map_transaction(&self, dto: TransactionDto) -> Result<CommittedTransaction> {
        let operation_groups = dto
            .operation_groups
            .into_iter()
            .map(|group| {
                let operations = group
                    .operations
                    .into_iter()
                    .map(|op| self.map_operation(op))
                    .collect::<Result<Vec<_>>>()?;
                Ok(OperationGroup { operations })
            })
            .collect::<Result<Vec<_>>>()?;

        let payload = match dto.payload {
            Some(payload) => Some(self.decode_hex("payload", &payload)?),
            None => None,
        };

        Ok(CommittedTransaction {
            state_version: dto.state_version,
            parent_state_version: dto.parent_state_version,
            transaction_identifier: self
                .decode_hash("transaction_identifier", &dto.transaction_identifier)?,
            accumulator: self.decode_hash("accumulator", &dto.accumulator)?,
            payload,
            fee_paid: self.parse_amount("fee_paid", &dto.fee_paid),
            round_in_epoch: dto.round_in_epoch,
            ends_epoch: dto.ends_epoch,
            timestamp: dto.timestamp,
            operation_groups,
        })
    }
}

#[async_trait]
impl NodeTransactionSource for HttpTransactionSource {
    async fn network_identity(&self) -> Result<String> {
        let response: NetworkConfigurationResponse = self
            .post("/network/configuration", &NetworkConfigurationRequest {})
            .await?;
        Ok(response.network)
    }

    async fn fetch(
        &self,
        after: StateVersion,
        max_count: usize,
    ) -> Result<Vec<CommittedTransaction>> {
        let request = TransactionsRequest {
            network: &self.network,
            from_state_version: after + 1,
            limit: max_count,
        };
        let response: TransactionsResponse = self.post("/transactions", &request).await?;

        let mut transactions = response
            .transactions
            .into_iter()
            .map(|dto| self.map_transaction(dto))
            .collect::<Result<Vec<_>>>()?;
        transactions.truncate(max_count);

        debug!(
            node = %self.node_name,
            after,
            received = transactions.len(),
            "Fetched transactions"
        );

        Ok(transactions)
    }
}
