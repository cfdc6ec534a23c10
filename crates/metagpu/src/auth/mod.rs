//! Caller authentication and visibility scoping for the management API.
//!
//! Every non public call is admitted once through
//! [`VisibilityAuthorizer::admit`], which yields a [`CallerContext`]. The
//! handlers only ever ask that context for a scope; none of them inspect the
//! token themselves.

use std::sync::Arc;

use api_types::token;
use api_types::VisibilityClaims;
use api_types::VisibilityLevel;
use api_types::AUTHORIZATION_METADATA_KEY;
use api_types::BEARER_PREFIX;
use error_stack::Report;
use error_stack::ResultExt;
use tonic::metadata::MetadataMap;
use tracing::debug;

use crate::config::ConfigStore;
use crate::registry::ProcessScope;
use crate::registry::ProcessSnapshot;

mod errors;

pub use errors::auth_status;
pub use errors::AuthError;

/// Management method short names.
pub mod methods {
    pub const LIST_DEVICE_PROCESSES_NAME: &str = "ListDeviceProcesses";
    pub const STREAM_DEVICE_PROCESSES_NAME: &str = "StreamDeviceProcesses";
    pub const KILL_GPU_PROCESS_NAME: &str = "KillGpuProcess";
    pub const PING_SERVER_NAME: &str = "PingServer";

    const MANAGED: [&str; 3] = [
        LIST_DEVICE_PROCESSES_NAME,
        STREAM_DEVICE_PROCESSES_NAME,
        KILL_GPU_PROCESS_NAME,
    ];

    /// Callable without a token
    const PUBLIC: [&str; 1] = [PING_SERVER_NAME];

    /// Methods with a configurable minimum visibility level.
    pub fn is_managed(method: &str) -> bool {
        MANAGED.contains(&method)
    }

    pub fn is_public(method: &str) -> bool {
        PUBLIC.contains(&method)
    }
}

/// Validates caller tokens against the active configuration.
pub struct VisibilityAuthorizer {
    config: Arc<ConfigStore>,
}

impl VisibilityAuthorizer {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }

    /// Verifies `token` with the current secret.
    pub fn authorize(&self, token: &str) -> Result<VisibilityClaims, Report<AuthError>> {
        let config = self.config.current();
        token::verify(token, config.jwt_secret.as_bytes()).change_context(
            AuthError::Unauthenticated {
                reason: "invalid token".to_string(),
            },
        )
    }

    /// Authenticates a call to `method` and checks the method's minimum level.
    pub fn admit(
        &self,
        method: &'static str,
        metadata: &MetadataMap,
    ) -> Result<CallerContext, Report<AuthError>> {
        if methods::is_public(method) {
            return Ok(CallerContext {
                method,
                claims: None,
            });
        }

        let claims = self.authorize(bearer_token(metadata)?)?;
        let minimum = self.config.current().visibility.minimum_level(method);
        if claims.visibility_level < minimum {
            return Err(AuthError::permission_denied(format!(
                "{method} requires visibility level {minimum}, token grants {}",
                claims.visibility_level
            )));
        }

        debug!(
            method,
            level = %claims.visibility_level,
            pod_id = claims.pod_id.as_deref().unwrap_or_default(),
            "caller admitted"
        );
        Ok(CallerContext {
            method,
            claims: Some(claims),
        })
    }
}

fn bearer_token(metadata: &MetadataMap) -> Result<&str, Report<AuthError>> {
    let value = metadata
        .get(AUTHORIZATION_METADATA_KEY)
        .ok_or_else(|| AuthError::unauthenticated("missing authorization metadata"))?
        .to_str()
        .change_context(AuthError::Unauthenticated {
            reason: "authorization metadata is not valid ASCII".to_string(),
        })?;
    let token = value.strip_prefix(BEARER_PREFIX).unwrap_or(value).trim();
    if token.is_empty() {
        return Err(AuthError::unauthenticated("empty token"));
    }
    Ok(token)
}

/// Request scoped caller identity, produced once per call (or stream).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    method: &'static str,
    claims: Option<VisibilityClaims>,
}

impl CallerContext {
    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn level(&self) -> Option<VisibilityLevel> {
        self.claims.as_ref().map(|claims| claims.visibility_level)
    }

    /// Turns the pod a caller asked for into the scope it may actually see.
    ///
    /// Device level callers always get the whole node. Lower levels must
    /// name a pod. A process level token must be bound to a pod and may
    /// name only that pod.
    pub fn resolve_scope(&self, requested_pod: &str) -> Result<ProcessScope, Report<AuthError>> {
        let Some(claims) = &self.claims else {
            return Err(AuthError::permission_denied(format!(
                "{} carries no caller identity",
                self.method
            )));
        };

        let level = claims.visibility_level;
        if level == VisibilityLevel::Device {
            return Ok(ProcessScope::AllPods);
        }

        let requested_pod = requested_pod.trim();
        if requested_pod.is_empty() {
            return Err(AuthError::permission_denied(format!(
                "missing pod id and visibility level is too low ({level}), can't proceed"
            )));
        }
        if level == VisibilityLevel::Process {
            match claims.pod_id.as_deref() {
                None => {
                    return Err(AuthError::permission_denied(format!(
                        "process level token is not bound to a pod, can't inspect pod {requested_pod}"
                    )));
                }
                Some(own_pod) if own_pod != requested_pod => {
                    return Err(AuthError::permission_denied(format!(
                        "process level token for pod {own_pod} can't inspect pod {requested_pod}"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(ProcessScope::Pod(requested_pod.to_string()))
    }

    /// Checks that the caller may kill `pid` given the latest process snapshot.
    pub fn authorize_kill(
        &self,
        pid: u32,
        requested_pod: &str,
        snapshot: &ProcessSnapshot,
    ) -> Result<(), Report<AuthError>> {
        let scope = self.resolve_scope(requested_pod)?;
        if scope == ProcessScope::AllPods {
            return Ok(());
        }
        match snapshot.find(pid) {
            Some(process) if scope.admits(process) => Ok(()),
            _ => Err(AuthError::permission_denied(format!(
                "process {pid} does not belong to pod {}",
                requested_pod.trim()
            ))),
        }
    }
}
