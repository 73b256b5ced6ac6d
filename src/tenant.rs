//! Tenant Identity and Access Control
//!
//! Every public cache operation resolves the calling tenant through a
//! [`TenantContext`] and checks it against the owner of the target cache or
//! manager. The configured super-tenant may access every tenant's caches.
//!
//! # Example
//!
//! ```ignore
//! let ctx = TaskLocalTenantContext::new();
//! TaskLocalTenantContext::scope(Tenant::new("acme.com", 7), async {
//!     cache.put("k".to_string(), 1).await
//! })
//! .await?;
//! ```

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Domain of the built-in super-tenant
pub const SUPER_TENANT_DOMAIN: &str = "super.tenant";

/// Numeric id of the built-in super-tenant
pub const SUPER_TENANT_ID: i32 = -1234;

/// Identity of a tenant (domain + numeric id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant domain, e.g. `acme.com`
    pub domain: String,
    /// Numeric tenant id
    pub id: i32,
}

impl Tenant {
    /// Create a tenant identity
    pub fn new(domain: impl Into<String>, id: i32) -> Self {
        Self {
            domain: domain.into(),
            id,
        }
    }

    /// The built-in super-tenant
    pub fn super_tenant() -> Self {
        Self::new(SUPER_TENANT_DOMAIN, SUPER_TENANT_ID)
    }
}

impl Default for Tenant {
    fn default() -> Self {
        Self::super_tenant()
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.domain, self.id)
    }
}

// =============================================================================
// Tenant Context Resolvers
// =============================================================================

/// Resolves the identity of the calling principal
pub trait TenantContext: Send + Sync {
    /// Tenant of the current caller, if any
    fn current_tenant(&self) -> Option<Tenant>;
}

tokio::task_local! {
    static CURRENT_TENANT: Tenant;
}

/// Resolver backed by a tokio task-local.
///
/// Callers run their cache work inside [`TaskLocalTenantContext::scope`].
/// Outside a scope no tenant is resolved and operations fail with
/// [`Error::NoTenantContext`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskLocalTenantContext;

impl TaskLocalTenantContext {
    /// Create the resolver
    pub fn new() -> Self {
        Self
    }

    /// Run `fut` with `tenant` as the calling tenant
    pub async fn scope<F>(tenant: Tenant, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_TENANT.scope(tenant, fut).await
    }

    /// Run a synchronous closure with `tenant` as the calling tenant
    pub fn sync_scope<F, R>(tenant: Tenant, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        CURRENT_TENANT.sync_scope(tenant, f)
    }
}

impl TenantContext for TaskLocalTenantContext {
    fn current_tenant(&self) -> Option<Tenant> {
        CURRENT_TENANT.try_with(|t| t.clone()).ok()
    }
}

/// Resolver that always yields the same tenant
#[derive(Debug, Clone)]
pub struct FixedTenantContext(Tenant);

impl FixedTenantContext {
    /// Create a resolver pinned to `tenant`
    pub fn new(tenant: Tenant) -> Self {
        Self(tenant)
    }
}

impl TenantContext for FixedTenantContext {
    fn current_tenant(&self) -> Option<Tenant> {
        Some(self.0.clone())
    }
}

// =============================================================================
// Tenant Guard
// =============================================================================

/// Access-control check comparing the caller with an owning tenant
#[derive(Debug, Clone)]
pub struct TenantGuard {
    owner: Tenant,
    super_tenant: Tenant,
}

impl TenantGuard {
    /// Create a guard for resources owned by `owner`
    pub fn new(owner: Tenant, super_tenant: Tenant) -> Self {
        Self {
            owner,
            super_tenant,
        }
    }

    /// Owning tenant
    pub fn owner(&self) -> &Tenant {
        &self.owner
    }

    /// Check whether `caller` may access the guarded resource
    pub fn permits(&self, caller: &Tenant) -> bool {
        *caller == self.owner || *caller == self.super_tenant
    }

    /// Resolve the caller from `ctx` and authorize it
    pub fn authorize(&self, ctx: &dyn TenantContext, resource: &str) -> Result<Tenant> {
        let caller = ctx.current_tenant().ok_or(Error::NoTenantContext)?;
        if self.permits(&caller) {
            Ok(caller)
        } else {
            Err(Error::AccessDenied {
                caller,
                owner: self.owner.clone(),
                resource: resource.to_string(),
            })
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
