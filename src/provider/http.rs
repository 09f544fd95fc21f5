//! HTTP JSON implementation of [`ChainProvider`]
//!
//! Thin default transport; the engine only depends on the trait, so hosts
//! embedding the wallet can substitute their own wire client.

use async_trait::async_trait;
use bitcoin::{Address, BlockHash, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use super::{
    pack_address_set, reversed_txid_bytes, BlockAppearance, ChainProvider, ChainTip, ProviderTx,
    TipStatus,
};
use crate::error::ProviderError;

pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    version_byte: u8,
}

#[derive(Deserialize)]
struct TipResponse {
    height: u32,
    hash: String,
    time: u64,
    synchronized: bool,
}

#[derive(Serialize)]
struct HistoryRequest {
    addresses: String,
    since_height: u32,
}

#[derive(Deserialize)]
struct TxResponse {
    raw: String,
    block_hash: Option<String>,
    block_height: Option<u32>,
    block_index: Option<u32>,
    time: u64,
}

#[derive(Serialize)]
struct SubscribeRequest {
    push_token: String,
    wallet_id: String,
    addresses: String,
}

#[derive(Deserialize)]
struct AckResponse {
    success: bool,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, version_byte: u8) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            version_byte,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn decode_tx(entry: TxResponse) -> Result<ProviderTx, ProviderError> {
        let raw = hex::decode(&entry.raw)
            .map_err(|e| ProviderError::Malformed(format!("raw tx hex: {}", e)))?;
        let tx: Transaction = bitcoin::consensus::encode::deserialize(&raw)
            .map_err(|e| ProviderError::Malformed(format!("raw tx: {}", e)))?;

        let block = match (entry.block_hash, entry.block_height) {
            (Some(hash), Some(height)) => Some(BlockAppearance {
                hash: BlockHash::from_str(&hash)
                    .map_err(|e| ProviderError::Malformed(format!("block hash: {}", e)))?,
                height,
                index: entry.block_index.unwrap_or(0),
                time: entry.time,
            }),
            _ => None,
        };

        Ok(ProviderTx {
            tx,
            block,
            time: entry.time,
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChainProvider for HttpProvider {
    async fn chain_tip(&self) -> Result<ChainTip, ProviderError> {
        let response = self.client.get(self.url("tip")).send().await?;
        let tip: TipResponse = Self::check(response).await?.json().await?;
        Ok(ChainTip {
            height: tip.height,
            hash: BlockHash::from_str(&tip.hash)
                .map_err(|e| ProviderError::Malformed(format!("tip hash: {}", e)))?,
            time: tip.time,
            status: if tip.synchronized {
                TipStatus::Synchronized
            } else {
                TipStatus::CatchingUp
            },
        })
    }

    async fn history(
        &self,
        addresses: &[Address],
        since_height: u32,
    ) -> Result<Vec<ProviderTx>, ProviderError> {
        let request = HistoryRequest {
            addresses: hex::encode(pack_address_set(addresses, self.version_byte)),
            since_height,
        };
        let response = self
            .client
            .post(self.url("history"))
            .json(&request)
            .send()
            .await?;
        let entries: Vec<TxResponse> = Self::check(response).await?.json().await?;
        entries.into_iter().map(Self::decode_tx).collect()
    }

    async fn transaction(&self, txid: Txid) -> Result<Option<ProviderTx>, ProviderError> {
        let path = format!("tx/{}", hex::encode(reversed_txid_bytes(txid)));
        let response = self.client.get(self.url(&path)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let entry: TxResponse = Self::check(response).await?.json().await?;
        Ok(Some(Self::decode_tx(entry)?))
    }

    async fn dependencies(
        &self,
        txid: Txid,
    ) -> Result<HashMap<Txid, Transaction>, ProviderError> {
        let path = format!("tx/{}/dependencies", hex::encode(reversed_txid_bytes(txid)));
        let response = self.client.get(self.url(&path)).send().await?;
        let entries: Vec<TxResponse> = Self::check(response).await?.json().await?;

        let mut parents = HashMap::with_capacity(entries.len());
        for entry in entries {
            let provider_tx = Self::decode_tx(entry)?;
            parents.insert(provider_tx.txid(), provider_tx.tx);
        }
        Ok(parents)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<bool, ProviderError> {
        let tx_hex = bitcoin::consensus::encode::serialize_hex(tx);
        log::debug!("Broadcasting transaction to {}", self.url("broadcast"));
        let response = self
            .client
            .post(self.url("broadcast"))
            .body(tx_hex)
            .send()
            .await?;
        let ack: AckResponse = Self::check(response).await?.json().await?;
        Ok(ack.success)
    }

    async fn subscribe(
        &self,
        push_token: &str,
        wallet_id: &str,
        addresses: &[Address],
    ) -> Result<bool, ProviderError> {
        let request = SubscribeRequest {
            push_token: push_token.to_string(),
            wallet_id: wallet_id.to_string(),
            addresses: hex::encode(pack_address_set(addresses, self.version_byte)),
        };
        let response = self
            .client
            .post(self.url("subscribe"))
            .json(&request)
            .send()
            .await?;
        let ack: AckResponse = Self::check(response).await?.json().await?;
        Ok(ack.success)
    }
}
