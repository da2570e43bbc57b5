//! Storage Facade
//!
//! Single entry point for every storage operation. Routes each request to the
//! first backend whose matcher accepts the acting identity and path, checks
//! that an identity is present, normalizes paths and records metrics. Holds
//! no persistent state of its own.

use crate::checksum::Checksum;
use crate::context::IdentityContext;
use crate::domain::path::NamespacePath;
use crate::domain::ports::{
    ByteStream, DataDriver, Download, FileInfo, MetaDataDriver, StorageDriver, StorageDriverRef,
    User,
};
use crate::error::{Error, ErrorCode, Result};
use crate::metrics::{outcome, GatewayMetrics};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Custom routing predicate
pub type RoutePredicate = Arc<dyn Fn(&User, &NamespacePath) -> bool + Send + Sync>;

// =============================================================================
// Routing
// =============================================================================

/// Decides whether a route serves a request
#[derive(Clone)]
pub enum RouteMatcher {
    /// Serves everything
    Any,
    /// Serves the prefix path and everything below it
    PathPrefix(NamespacePath),
    /// Serves the listed usernames
    Users(Vec<String>),
    Predicate(RoutePredicate),
}

impl RouteMatcher {
    pub fn matches(&self, user: &User, path: &NamespacePath) -> bool {
        match self {
            RouteMatcher::Any => true,
            RouteMatcher::PathPrefix(prefix) => prefix == path || prefix.is_ancestor_of(path),
            RouteMatcher::Users(users) => users.iter().any(|u| u == &user.username),
            RouteMatcher::Predicate(predicate) => predicate(user, path),
        }
    }
}

impl fmt::Debug for RouteMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMatcher::Any => f.write_str("Any"),
            RouteMatcher::PathPrefix(prefix) => f.debug_tuple("PathPrefix").field(prefix).finish(),
            RouteMatcher::Users(users) => f.debug_tuple("Users").field(users).finish(),
            RouteMatcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// One routing rule: a matcher and the backend it selects
#[derive(Clone)]
pub struct BackendRoute {
    pub name: String,
    pub matcher: RouteMatcher,
    pub driver: StorageDriverRef,
}

impl BackendRoute {
    /// Route named after its driver
    pub fn new(matcher: RouteMatcher, driver: StorageDriverRef) -> Self {
        Self {
            name: driver.name().to_string(),
            matcher,
            driver,
        }
    }
}

impl fmt::Debug for BackendRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRoute")
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .field("capabilities", self.driver.capabilities())
            .finish()
    }
}

// =============================================================================
// Storage Facade
// =============================================================================

/// Predicate-routed front for the configured backends
pub struct StorageFacade {
    routes: Vec<BackendRoute>,
    metrics: GatewayMetrics,
}

impl StorageFacade {
    pub fn new(metrics: GatewayMetrics) -> Self {
        Self {
            routes: Vec::new(),
            metrics,
        }
    }

    /// Append a route; earlier routes take precedence
    pub fn with_route(mut self, route: BackendRoute) -> Self {
        info!(backend = %route.name, matcher = ?route.matcher, "Backend route added");
        self.routes.push(route);
        self
    }

    pub fn routes(&self) -> &[BackendRoute] {
        &self.routes
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// First route serving `path` for the context's identity
    pub fn resolve(&self, ctx: &IdentityContext, path: &NamespacePath) -> Result<&BackendRoute> {
        let user = ctx.require_user()?;
        self.route_for(user, path)
    }

    fn route_for(&self, user: &User, path: &NamespacePath) -> Result<&BackendRoute> {
        self.routes
            .iter()
            .find(|route| route.matcher.matches(user, path))
            .ok_or_else(|| {
                Error::Internal(format!(
                    "no backend serves {} for user {}",
                    path, user.username
                ))
            })
    }

    fn prepare(&self, ctx: &IdentityContext, raw: &str) -> Result<(NamespacePath, &BackendRoute)> {
        let user = ctx.require_user()?;
        let path = NamespacePath::parse(raw)?;
        let route = self.route_for(user, &path)?;
        Ok((path, route))
    }

    fn timer(&self, operation: &str) -> prometheus::HistogramTimer {
        self.metrics
            .operation_duration
            .with_label_values(&[operation])
            .start_timer()
    }

    // =========================================================================
    // Data Plane
    // =========================================================================

    pub async fn upload_file(
        &self,
        ctx: &IdentityContext,
        path: &str,
        stream: ByteStream,
        client_checksum: Option<&Checksum>,
    ) -> Result<FileInfo> {
        let (path, route) = self.prepare(ctx, path)?;
        let _timer = self.timer("upload");

        match route.driver.upload_file(ctx, &path, stream, client_checksum).await {
            Ok(info) => {
                self.metrics
                    .uploads
                    .with_label_values(&[&route.name, outcome::OK])
                    .inc();
                self.metrics
                    .bytes_uploaded
                    .with_label_values(&[&route.name])
                    .inc_by(info.size);
                info!(
                    parent: ctx.span(),
                    backend = %route.name,
                    path = %path,
                    size = info.size,
                    "File uploaded"
                );
                Ok(info)
            }
            Err(e) => {
                if e.code() == ErrorCode::BadChecksum {
                    self.metrics
                        .checksum_failures
                        .with_label_values(&[&route.name])
                        .inc();
                }
                self.metrics
                    .uploads
                    .with_label_values(&[&route.name, outcome::ERROR])
                    .inc();
                warn!(parent: ctx.span(), backend = %route.name, path = %path, "Upload failed: {}", e);
                Err(e)
            }
        }
    }

    pub async fn download_file(&self, ctx: &IdentityContext, path: &str) -> Result<Download> {
        let (path, route) = self.prepare(ctx, path)?;
        let _timer = self.timer("download");
        let download = route.driver.download_file(ctx, &path).await?;
        self.metrics
            .downloads
            .with_label_values(&[&route.name])
            .inc();
        debug!(parent: ctx.span(), backend = %route.name, path = %path, "Download started");
        Ok(download)
    }

    // =========================================================================
    // Metadata Plane
    // =========================================================================

    pub async fn examine(&self, ctx: &IdentityContext, path: &str) -> Result<FileInfo> {
        let (path, route) = self.prepare(ctx, path)?;
        let _timer = self.timer("examine");
        route.driver.examine(ctx, &path).await
    }

    pub async fn list_folder(&self, ctx: &IdentityContext, path: &str) -> Result<Vec<FileInfo>> {
        let (path, route) = self.prepare(ctx, path)?;
        let _timer = self.timer("list_folder");
        route.driver.list_folder(ctx, &path).await
    }

    /// Move within one backend; moves across backends are rejected
    pub async fn move_entry(&self, ctx: &IdentityContext, source: &str, target: &str) -> Result<()> {
        let (source, source_route) = self.prepare(ctx, source)?;
        let (target, target_route) = self.prepare(ctx, target)?;
        if !std::ptr::eq(source_route, target_route) {
            return Err(Error::BadInputData(format!(
                "cannot move {} ({}) to {} ({}) across backends",
                source, source_route.name, target, target_route.name
            )));
        }
        let _timer = self.timer("move");
        source_route.driver.move_entry(ctx, &source, &target).await
    }

    pub async fn delete(&self, ctx: &IdentityContext, path: &str) -> Result<()> {
        let (path, route) = self.prepare(ctx, path)?;
        let _timer = self.timer("delete");
        route.driver.delete(ctx, &path).await
    }

    pub async fn create_folder(&self, ctx: &IdentityContext, path: &str) -> Result<()> {
        let (path, route) = self.prepare(ctx, path)?;
        let _timer = self.timer("create_folder");
        route.driver.create_folder(ctx, &path).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create the identity's home on every backend that asks for it
    pub async fn bootstrap_home(&self, ctx: &IdentityContext) -> Result<()> {
        ctx.require_user()?;
        let mut seen = HashSet::new();
        for route in &self.routes {
            if !route.driver.capabilities().create_home_dir || !seen.insert(route.driver.name()) {
                continue;
            }
            route.driver.init_home(ctx).await?;
        }
        Ok(())
    }

    /// Health of each distinct backend
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let mut seen = HashSet::new();
        let mut report = Vec::new();
        for route in &self.routes {
            if !seen.insert(route.driver.name()) {
                continue;
            }
            let healthy = route.driver.health_check().await.unwrap_or(false);
            report.push((route.name.clone(), healthy));
        }
        report
    }
}

impl fmt::Debug for StorageFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageFacade")
            .field("routes", &self.routes)
            .finish()
    }
}
