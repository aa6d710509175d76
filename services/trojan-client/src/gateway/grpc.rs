//! gRPC adapter over trojan-go's API service.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ssmgr_proto::trojan::api::{
    set_users_request::Operation, ListUsersRequest, SetUsersRequest, Traffic,
    TrojanServerServiceClient, User, UserStatus,
};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use super::{AccountChange, AccountGateway, AccountIndex, GatewayError, LiveAccount, SetOperation};

/// Timeout applied to every API call.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Account gateway backed by a trojan-go API endpoint.
pub struct GrpcGateway {
    client: TrojanServerServiceClient<Channel>,
    index: Mutex<AccountIndex>,
}

impl GrpcGateway {
    /// Create a gateway for `host:port`.
    ///
    /// The channel connects lazily, so this succeeds before the proxy is up.
    pub fn new(host: &str, port: u16) -> Result<Self, GatewayError> {
        let endpoint = Endpoint::from_shared(format!("http://{}:{}", host, port))
            .map_err(|e| GatewayError::Endpoint(e.to_string()))?
            .timeout(RPC_TIMEOUT);

        Ok(Self {
            client: TrojanServerServiceClient::new(endpoint.connect_lazy()),
            index: Mutex::new(AccountIndex::new()),
        })
    }

    /// Ledger id last bound to a hash through this gateway.
    pub fn account_id(&self, password_hash: &str) -> Option<i64> {
        self.index
            .lock()
            .ok()
            .and_then(|index| index.account_id(password_hash))
    }

    /// Ledger id for a change, falling back to the index for removals and
    /// clears, which only carry a hash.
    fn resolve_id(&self, change: &AccountChange) -> Option<i64> {
        change
            .account_id
            .or_else(|| self.account_id(&change.password_hash))
    }

    fn record(&self, change: &AccountChange) {
        if let Ok(mut index) = self.index.lock() {
            index.apply(change);
        }
    }
}

#[async_trait]
impl AccountGateway for GrpcGateway {
    async fn list_accounts(&self) -> Result<Vec<LiveAccount>, GatewayError> {
        let mut client = self.client.clone();
        let mut stream = client.list_users(ListUsersRequest {}).await?.into_inner();

        let mut accounts = Vec::new();
        while let Some(response) = stream.message().await? {
            let Some(status) = response.status else {
                continue;
            };
            let Some(hash) = status.user.map(|u| u.hash).filter(|h| !h.is_empty()) else {
                continue;
            };
            let traffic_total = status
                .traffic_total
                .map(|t| t.upload_traffic.saturating_add(t.download_traffic))
                .unwrap_or(0);

            accounts.push(LiveAccount {
                password_hash: hash,
                traffic_total,
            });
        }

        debug!(count = accounts.len(), "Listed live accounts");
        Ok(accounts)
    }

    async fn set_accounts(&self, changes: Vec<AccountChange>) -> Result<(), GatewayError> {
        if changes.is_empty() {
            return Ok(());
        }

        let requests: Vec<SetUsersRequest> = changes.iter().map(to_request).collect();
        let mut client = self.client.clone();
        let mut stream = client
            .set_users(tokio_stream::iter(requests))
            .await?
            .into_inner();

        let mut acknowledged = 0usize;
        while let Some(response) = stream.message().await? {
            let Some(change) = changes.get(acknowledged) else {
                break;
            };
            acknowledged += 1;

            let account_id = self.resolve_id(change);
            if !response.success {
                warn!(
                    account_id,
                    operation = ?change.operation,
                    info = %response.info,
                    "trojan-go rejected account change"
                );
                return Err(GatewayError::Rejected {
                    operation: change.operation,
                    password_hash: change.password_hash.clone(),
                    info: response.info,
                });
            }
            if change.operation == SetOperation::Remove {
                debug!(account_id, "Account removed from trojan-go");
            }
            self.record(change);
        }

        // Drain anything left so the call completes cleanly.
        while stream.message().await?.is_some() {}

        debug!(
            requested = changes.len(),
            acknowledged, "Applied account changes"
        );
        Ok(())
    }
}

fn to_request(change: &AccountChange) -> SetUsersRequest {
    let operation = match change.operation {
        SetOperation::Add => Operation::Add,
        SetOperation::Remove => Operation::Delete,
        SetOperation::Modify => Operation::Modify,
    };

    SetUsersRequest {
        operation: operation.into(),
        status: Some(UserStatus {
            user: Some(User {
                password: String::new(),
                hash: change.password_hash.clone(),
            }),
            traffic_total: change.traffic_total.map(|total| Traffic {
                upload_traffic: total,
                download_traffic: 0,
            }),
            ..Default::default()
        }),
    }
}
