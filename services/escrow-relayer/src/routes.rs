// Copyright 2024 Escrow Relayer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use ethers::types::H256;
use serde::Deserialize;

use escrow_relayer_context::RelayerContext;
use escrow_relayer_store::AmbRegistry;

/// Query string of the `getAMBs` endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAmbsQuery {
    /// Source transaction to look messages up by.
    pub transaction_hash: H256,
}

/// `GET /getAMBs?transactionHash=…` — every AMB message observed in a
/// given source transaction.
pub async fn handle_get_ambs(
    State(ctx): State<Arc<RelayerContext>>,
    Query(query): Query<GetAmbsQuery>,
) -> Response {
    match ctx
        .store()
        .ambs_by_transaction_hash(&query.transaction_hash)
    {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => {
            tracing::error!("getAMBs lookup failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "message": "store lookup failed",
                })),
            )
                .into_response()
        }
    }
}

/// Builds the HTTP router of the relayer.
pub fn build_web_services() -> Router<Arc<RelayerContext>> {
    Router::new().route("/getAMBs", get(handle_get_ambs))
}
