//! Fetch-and-store entry point plus the per-resource convenience operations.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{attachment_download_url, detail_url, sub_resource_url, ResourceType};
use crate::config::SyncConfig;
use crate::credentials::{AesGcmCipher, CredentialStore, SecretCipher};
use crate::error::{FetchError, FetchResult};
use crate::mapper::{to_canonical, CanonicalEntity, RawRecord, StorageKind};
use crate::paginator::{extract_records, Paginator};
use crate::session::SessionManager;
use crate::store::EntityStore;
use crate::transport::{ApiRequest, HttpClients, RetryingTransport};

const MAX_FILE_NAME_CHARS: usize = 200;

/// Outcome of one fetch-and-store call, shaped for an upstream API.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub count: usize,
    pub entities: Vec<CanonicalEntity>,
    /// Pagination stopped early; `entities` holds what was stored.
    pub partial: bool,
    pub message: String,
}

impl SyncResult {
    fn complete(resource: ResourceType, entities: Vec<CanonicalEntity>) -> Self {
        Self {
            success: true,
            count: entities.len(),
            message: format!("Synced {} {}", entities.len(), resource),
            entities,
            partial: false,
        }
    }

    /// An authentication cause leads the message so the caller still knows
    /// to prompt for credentials.
    fn partial(resource: ResourceType, entities: Vec<CanonicalEntity>, cause: &FetchError) -> Self {
        let incomplete = format!(
            "Sync of {} incomplete, only {} records retrieved",
            resource,
            entities.len()
        );
        let message = if cause.is_auth_failure() {
            format!("{}: {}", cause, incomplete)
        } else {
            incomplete
        };
        Self {
            success: false,
            count: entities.len(),
            message,
            entities,
            partial: true,
        }
    }

    /// Authentication failures keep their precise message so the caller can
    /// prompt for credentials. Everything else is reported generically.
    fn failure(resource: &str, e: &FetchError) -> Self {
        let message = if e.is_auth_failure() {
            e.to_string()
        } else {
            format!("Failed to sync {}", resource)
        };
        Self {
            success: false,
            count: 0,
            entities: Vec::new(),
            partial: false,
            message,
        }
    }
}

/// Domain and project every project-level resource lives under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectScope {
    pub domain: String,
    pub project: String,
}

impl ProjectScope {
    pub fn new(domain: &str, project: &str) -> Self {
        Self {
            domain: domain.to_string(),
            project: project.to_string(),
        }
    }

    pub fn path_params(&self) -> HashMap<String, String> {
        HashMap::from([
            ("domain".to_string(), self.domain.clone()),
            ("project".to_string(), self.project.clone()),
        ])
    }
}

/// A single entity refreshed from its detail endpoint.
#[derive(Debug, Clone)]
pub struct EntityDetails {
    pub entity: CanonicalEntity,
    /// Design steps or run steps, in server order.
    pub steps: Vec<RawRecord>,
}

#[derive(Debug, Clone)]
pub struct DownloadedAttachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Fetches ALM listings and caches them locally.
///
/// Cheap to clone; clones share the session, the transport and the store.
#[derive(Clone)]
pub struct SyncEngine {
    paginator: Arc<Paginator>,
    store: Arc<EntityStore>,
    group: String,
}

impl SyncEngine {
    pub fn new(paginator: Arc<Paginator>, store: Arc<EntityStore>, default_group: &str) -> Self {
        Self {
            paginator,
            store,
            group: default_group.to_string(),
        }
    }

    /// Wires every layer from configuration.
    ///
    /// `encryption_key` is the base64 AES-256 key for the credential cache.
    pub fn from_config(config: &SyncConfig, encryption_key: &str) -> anyhow::Result<Self> {
        let clients = HttpClients::from_config(&config.http)?;
        let cipher: Arc<dyn SecretCipher> = Arc::new(
            AesGcmCipher::from_base64_key(encryption_key)
                .context("Invalid credential encryption key")?,
        );
        let credentials = Arc::new(CredentialStore::new(&config.store.path)?);
        let session = Arc::new(SessionManager::new(
            clients.metadata.clone(),
            &config.alm.base_url,
            &config.alm.client_type,
            credentials,
            cipher,
        ));
        let transport = Arc::new(RetryingTransport::new(
            clients,
            session,
            config.http.max_attempts,
        ));
        let paginator = Arc::new(Paginator::new(transport, &config.alm.base_url));
        let store = Arc::new(EntityStore::new(&config.store.path)?);

        info!(
            base_url = %config.alm.base_url,
            store = %config.store.path,
            "Sync engine ready"
        );
        Ok(Self::new(paginator, store, &config.sync.default_group))
    }

    /// Same engine, writing into another group.
    pub fn with_group(&self, group: &str) -> Self {
        Self {
            group: group.to_string(),
            ..self.clone()
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        self.paginator.transport().session()
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Cancelling the token aborts all in-flight calls of this engine.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.paginator.transport().cancellation_token()
    }

    /// Interactive login; the secret is cached for later re-authentication.
    pub async fn login(&self, owner: &str, secret: &str) -> FetchResult<()> {
        self.session().authenticate(owner, secret).await
    }

    pub async fn logout(&self, owner: &str) {
        self.session().logout(owner).await
    }

    /// Fetches every record of `resource` and replaces the stored copies.
    ///
    /// `filters["parent_id"]`, when present, becomes the stored parent of
    /// every record. Never fails: the outcome is folded into the result.
    pub async fn fetch_and_store(
        &self,
        resource: &str,
        owner: &str,
        path_params: &HashMap<String, String>,
        group: &str,
        filters: &HashMap<String, String>,
    ) -> SyncResult {
        match self
            .try_fetch_and_store(resource, owner, path_params, group, filters)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(resource = %resource, owner = %owner, error = %e, "Sync failed");
                SyncResult::failure(resource, &e)
            }
        }
    }

    async fn try_fetch_and_store(
        &self,
        resource: &str,
        owner: &str,
        path_params: &HashMap<String, String>,
        group: &str,
        filters: &HashMap<String, String>,
    ) -> FetchResult<SyncResult> {
        let resource: ResourceType = resource.parse()?;
        self.session().ensure_authenticated(owner).await?;

        let mut fetched = self
            .paginator
            .fetch_all(resource, owner, path_params, filters)
            .await?;

        // Attachments listed under a known parent type land in that
        // parent's collection even when the server omits `parent-type`.
        if resource == ResourceType::Attachments {
            if let Some(parent_type) = filters.get("parent_type") {
                for record in fetched.records.iter_mut() {
                    if record.get("parent-type").is_none() {
                        record.set("parent-type", Some(parent_type.clone()));
                    }
                }
            }
        }

        let parent_id = filters.get("parent_id").map(String::as_str);
        let entities = self
            .store
            .store_mapped(resource, &fetched.records, owner, parent_id, group)?;

        if let Some(cause) = &fetched.failure {
            warn!(
                resource = %resource,
                stored = entities.len(),
                error = %cause,
                "Stored partial listing"
            );
            return Ok(SyncResult::partial(resource, entities, cause));
        }

        info!(
            resource = %resource,
            owner = %owner,
            group = %group,
            count = entities.len(),
            "Synced"
        );
        Ok(SyncResult::complete(resource, entities))
    }

    async fn sync(
        &self,
        resource: ResourceType,
        owner: &str,
        path_params: HashMap<String, String>,
        filters: &[(&str, &str)],
    ) -> SyncResult {
        let filters: HashMap<String, String> = filters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.fetch_and_store(resource.as_str(), owner, &path_params, &self.group, &filters)
            .await
    }

    pub async fn sync_domains(&self, owner: &str) -> SyncResult {
        self.sync(ResourceType::Domains, owner, HashMap::new(), &[])
            .await
    }

    pub async fn sync_projects(&self, owner: &str, domain: &str) -> SyncResult {
        let path = HashMap::from([("domain".to_string(), domain.to_string())]);
        self.sync(ResourceType::Projects, owner, path, &[("parent_id", domain)])
            .await
    }

    /// Top of the test plan tree; root folders have parent `0`.
    pub async fn sync_root_test_folders(&self, owner: &str, scope: &ProjectScope) -> SyncResult {
        self.sync_test_folders(owner, scope, "0").await
    }

    pub async fn sync_test_folders(
        &self,
        owner: &str,
        scope: &ProjectScope,
        parent_id: &str,
    ) -> SyncResult {
        self.sync(
            ResourceType::TestFolders,
            owner,
            scope.path_params(),
            &[("parent_id", parent_id)],
        )
        .await
    }

    pub async fn sync_tests(
        &self,
        owner: &str,
        scope: &ProjectScope,
        folder_id: &str,
    ) -> SyncResult {
        self.sync(
            ResourceType::Tests,
            owner,
            scope.path_params(),
            &[("parent_id", folder_id)],
        )
        .await
    }

    pub async fn sync_design_steps(
        &self,
        owner: &str,
        scope: &ProjectScope,
        test_id: &str,
    ) -> SyncResult {
        self.sync(
            ResourceType::DesignSteps,
            owner,
            scope.path_params(),
            &[("parent_id", test_id)],
        )
        .await
    }

    pub async fn sync_releases(&self, owner: &str, scope: &ProjectScope) -> SyncResult {
        self.sync(ResourceType::Releases, owner, scope.path_params(), &[])
            .await
    }

    pub async fn sync_release_cycles(
        &self,
        owner: &str,
        scope: &ProjectScope,
        release_id: &str,
    ) -> SyncResult {
        self.sync(
            ResourceType::ReleaseCycles,
            owner,
            scope.path_params(),
            &[("parent_id", release_id)],
        )
        .await
    }

    pub async fn sync_test_sets(
        &self,
        owner: &str,
        scope: &ProjectScope,
        cycle_id: &str,
    ) -> SyncResult {
        self.sync(
            ResourceType::TestSets,
            owner,
            scope.path_params(),
            &[("cycle_id", cycle_id), ("parent_id", cycle_id)],
        )
        .await
    }

    pub async fn sync_test_runs(
        &self,
        owner: &str,
        scope: &ProjectScope,
        test_set_id: &str,
    ) -> SyncResult {
        self.sync(
            ResourceType::TestRuns,
            owner,
            scope.path_params(),
            &[("testset_id", test_set_id), ("parent_id", test_set_id)],
        )
        .await
    }

    /// Defects are stored with the project as parent.
    pub async fn sync_defects(&self, owner: &str, scope: &ProjectScope) -> SyncResult {
        self.sync(
            ResourceType::Defects,
            owner,
            scope.path_params(),
            &[("parent_id", scope.project.as_str())],
        )
        .await
    }

    pub async fn sync_attachments(
        &self,
        owner: &str,
        scope: &ProjectScope,
        parent_type: &str,
        parent_id: &str,
    ) -> SyncResult {
        self.sync(
            ResourceType::Attachments,
            owner,
            scope.path_params(),
            &[("parent_type", parent_type), ("parent_id", parent_id)],
        )
        .await
    }

    /// Refreshes one test and its design steps.
    pub async fn fetch_test_details(
        &self,
        owner: &str,
        scope: &ProjectScope,
        test_id: &str,
    ) -> FetchResult<EntityDetails> {
        let details = self
            .fetch_details(owner, scope, ResourceType::Tests, test_id, None, Some("design-steps"))
            .await?;
        self.store.store(
            ResourceType::DesignSteps,
            &details.steps,
            owner,
            Some(test_id),
            &self.group,
        )?;
        Ok(details)
    }

    /// Refreshes one run and reads its run steps.
    pub async fn fetch_run_details(
        &self,
        owner: &str,
        scope: &ProjectScope,
        run_id: &str,
    ) -> FetchResult<EntityDetails> {
        self.fetch_details(owner, scope, ResourceType::TestRuns, run_id, None, Some("run-steps"))
            .await
    }

    pub async fn fetch_defect_details(
        &self,
        owner: &str,
        scope: &ProjectScope,
        defect_id: &str,
    ) -> FetchResult<CanonicalEntity> {
        let details = self
            .fetch_details(
                owner,
                scope,
                ResourceType::Defects,
                defect_id,
                Some(scope.project.as_str()),
                None,
            )
            .await?;
        Ok(details.entity)
    }

    async fn fetch_details(
        &self,
        owner: &str,
        scope: &ProjectScope,
        resource: ResourceType,
        id: &str,
        parent_id: Option<&str>,
        steps: Option<&str>,
    ) -> FetchResult<EntityDetails> {
        self.session().ensure_authenticated(owner).await?;
        let transport = self.paginator.transport();
        let base = self.paginator.base_url();
        let path = scope.path_params();

        let url = detail_url(base, resource, &path, id)?;
        let body = transport.request(&ApiRequest::get(url).owner(owner)).await?;
        let raw = RawRecord::from_json(&body)?;

        // Keep the parent the entity was listed under when the detail
        // payload does not carry one.
        let previous = self.store.get(
            owner,
            &self.group,
            StorageKind::for_entity(resource, None),
            id,
        )?;
        let parent_id = parent_id
            .map(str::to_string)
            .or_else(|| raw.get("parent-id").map(str::to_string))
            .or_else(|| previous.and_then(|p| p.parent_id));

        let mut entity = to_canonical(resource, &raw, owner, parent_id.as_deref());
        entity.group = self.group.clone();
        self.store.upsert_entity(&entity)?;

        let steps = match steps {
            Some(sub) => {
                let url = sub_resource_url(base, resource, &path, id, sub)?;
                let body = transport.request(&ApiRequest::get(url).owner(owner)).await?;
                extract_records(&body, &["entities"])?
            }
            None => Vec::new(),
        };

        info!(resource = %resource, id = %id, steps = steps.len(), "Fetched details");
        Ok(EntityDetails { entity, steps })
    }

    /// Downloads an attachment's content on the download pool.
    ///
    /// The file name comes from the stored attachment row when one exists.
    pub async fn download_attachment(
        &self,
        owner: &str,
        scope: &ProjectScope,
        attachment_id: &str,
    ) -> FetchResult<DownloadedAttachment> {
        self.session().ensure_authenticated(owner).await?;

        let url = attachment_download_url(
            self.paginator.base_url(),
            &scope.domain,
            &scope.project,
            attachment_id,
        );
        let bytes = self.paginator.transport().download(&url, owner).await?;

        let stored_name = self
            .store
            .find_attachment(owner, &self.group, attachment_id)?
            .map(|a| a.name)
            .filter(|n| !n.is_empty());
        let file_name = match stored_name {
            Some(name) => sanitize_file_name(&name),
            None => sanitize_file_name(&format!("attachment_{}", attachment_id)),
        };

        info!(
            id = %attachment_id,
            file_name = %file_name,
            size = bytes.len(),
            "Attachment downloaded"
        );
        Ok(DownloadedAttachment { file_name, bytes })
    }
}

impl DownloadedAttachment {
    /// Content as base64, for JSON transports.
    pub fn content_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }
}

/// Makes a server-supplied name safe to use as a local file name.
pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();

    let trimmed: String = replaced
        .trim_matches(|c| c == '.' || c == ' ')
        .chars()
        .take(MAX_FILE_NAME_CHARS)
        .collect();

    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AUTHENTICATE_PATH, SITE_SESSION_PATH};
    use crate::config::HttpConfig;
    use crate::session::SessionPhase;
    use mockito::{Matcher, Mock, Server, ServerGuard};
    use serde_json::json;

    fn engine(server: &ServerGuard) -> SyncEngine {
        let clients = HttpClients::from_config(&HttpConfig::default()).unwrap();
        let session = Arc::new(SessionManager::new(
            clients.metadata.clone(),
            &server.url(),
            "REST-Client",
            Arc::new(CredentialStore::new(":memory:").unwrap()),
            Arc::new(AesGcmCipher::from_base64_key(&BASE64.encode([9u8; 32])).unwrap()),
        ));
        let transport = Arc::new(RetryingTransport::new(clients, session, 3));
        let paginator = Arc::new(Paginator::new(transport, &server.url()));
        let store = Arc::new(EntityStore::new(":memory:").unwrap());
        SyncEngine::new(paginator, store, "default")
    }

    async fn mock_handshake(server: &mut ServerGuard) -> (Mock, Mock) {
        let auth = server
            .mock("GET", AUTHENTICATE_PATH)
            .with_status(200)
            .with_header("set-cookie", "LWSSO_COOKIE_KEY=lw")
            .create_async()
            .await;
        let site = server
            .mock("POST", SITE_SESSION_PATH)
            .with_status(201)
            .with_header("set-cookie", "QCSession=qc")
            .create_async()
            .await;
        (auth, site)
    }

    fn entity(fields: &[(&str, &str)]) -> serde_json::Value {
        let fields: Vec<_> = fields
            .iter()
            .map(|(name, value)| json!({"Name": name, "values": [{"value": value}]}))
            .collect();
        json!({"Fields": fields})
    }

    fn scope() -> ProjectScope {
        ProjectScope::new("D", "P")
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report<v2>:final?.txt"), "report_v2__final_.txt");
        assert_eq!(sanitize_file_name("a/b\\c|d*e\"f"), "a_b_c_d_e_f");
        assert_eq!(sanitize_file_name("  ..notes.. "), "notes");
        assert_eq!(sanitize_file_name(" . "), "unnamed");
        assert_eq!(sanitize_file_name(""), "unnamed");
        assert_eq!(sanitize_file_name(&"x".repeat(300)).chars().count(), 200);
    }

    #[tokio::test]
    async fn test_unknown_resource_is_generic_failure() {
        let server = Server::new_async().await;
        let result = engine(&server)
            .fetch_and_store("widgets", "alice", &HashMap::new(), "default", &HashMap::new())
            .await;

        assert!(!result.success);
        assert_eq!(result.count, 0);
        assert_eq!(result.message, "Failed to sync widgets");
    }

    #[tokio::test]
    async fn test_missing_credentials_keep_precise_message() {
        let server = Server::new_async().await;
        let result = engine(&server).sync_domains("nobody").await;

        assert!(!result.success);
        assert_eq!(result.message, "no cached credential available for nobody");
    }

    #[tokio::test]
    async fn test_test_sets_filter_by_cycle_and_store_parent() {
        let mut server = Server::new_async().await;
        let _handshake = mock_handshake(&mut server).await;
        let sets = server
            .mock("GET", "/rest/domains/D/projects/P/test-sets")
            .match_query(Matcher::UrlEncoded("query".into(), "{cycle-id[7]}".into()))
            .with_status(200)
            .with_body(
                json!({"entities": [
                    entity(&[("id", "70"), ("name", "Smoke")]),
                    entity(&[("id", "71"), ("name", "Regression")]),
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let engine = engine(&server);
        engine.login("alice", "pw").await.unwrap();
        let result = engine.sync_test_sets("alice", &scope(), "7").await;

        sets.assert_async().await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.count, 2);
        let stored = engine
            .store()
            .children("alice", "default", StorageKind::TestlabTestsets, "7")
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_with_group_writes_elsewhere() {
        let mut server = Server::new_async().await;
        let _handshake = mock_handshake(&mut server).await;
        let _releases = server
            .mock("GET", "/rest/domains/D/projects/P/releases")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"entities": [entity(&[("id", "1"), ("name", "R1")])]}).to_string())
            .create_async()
            .await;

        let engine = engine(&server);
        engine.login("alice", "pw").await.unwrap();
        let nightly = engine.with_group("nightly");
        assert_eq!(nightly.group(), "nightly");
        assert_eq!(engine.group(), "default");
        assert!(nightly.sync_releases("alice", &scope()).await.success);

        let store = engine.store();
        assert_eq!(store.count("alice", "nightly", StorageKind::TestlabReleases).unwrap(), 1);
        assert_eq!(store.count("alice", "default", StorageKind::TestlabReleases).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_test_details_store_design_steps() {
        let mut server = Server::new_async().await;
        let _handshake = mock_handshake(&mut server).await;
        let _test = server
            .mock("GET", "/rest/domains/D/projects/P/tests/12")
            .with_status(200)
            .with_body(entity(&[("id", "12"), ("name", "Login"), ("parent-id", "3")]).to_string())
            .create_async()
            .await;
        let _steps = server
            .mock("GET", "/rest/domains/D/projects/P/tests/12/design-steps")
            .with_status(200)
            .with_body(
                json!({"entities": [
                    entity(&[("id", "100"), ("name", "Step 1"), ("step-order", "1")]),
                    entity(&[("id", "101"), ("name", "Step 2"), ("step-order", "2")]),
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let engine = engine(&server);
        engine.login("alice", "pw").await.unwrap();
        let details = engine.fetch_test_details("alice", &scope(), "12").await.unwrap();

        assert_eq!(details.entity.name, "Login");
        assert_eq!(details.entity.parent_id.as_deref(), Some("3"));
        assert_eq!(details.steps.len(), 2);

        let store = engine.store();
        assert!(store
            .get("alice", "default", StorageKind::TestplanTests, "12")
            .unwrap()
            .is_some());
        let steps = store
            .children("alice", "default", StorageKind::TestplanTestDesignSteps, "12")
            .unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[tokio::test]
    async fn test_defect_details_parented_by_project() {
        let mut server = Server::new_async().await;
        let _handshake = mock_handshake(&mut server).await;
        let _defect = server
            .mock("GET", "/rest/domains/D/projects/P/defects/55")
            .with_status(200)
            .with_body(
                entity(&[("id", "55"), ("name", "Crash"), ("severity", "2-High")]).to_string(),
            )
            .create_async()
            .await;

        let engine = engine(&server);
        engine.login("alice", "pw").await.unwrap();
        let defect = engine.fetch_defect_details("alice", &scope(), "55").await.unwrap();

        assert_eq!(defect.parent_id.as_deref(), Some("P"));
        assert_eq!(defect.field("severity"), Some("2-High"));
    }

    #[tokio::test]
    async fn test_run_details_return_steps() {
        let mut server = Server::new_async().await;
        let _handshake = mock_handshake(&mut server).await;
        let _run = server
            .mock("GET", "/rest/domains/D/projects/P/runs/9")
            .with_status(200)
            .with_body(entity(&[("id", "9"), ("name", "Run_9"), ("testcycl-id", "70")]).to_string())
            .create_async()
            .await;
        let _steps = server
            .mock("GET", "/rest/domains/D/projects/P/runs/9/run-steps")
            .with_status(200)
            .with_body(
                json!({"entities": [entity(&[("id", "1"), ("status", "Passed")])]}).to_string(),
            )
            .create_async()
            .await;

        let engine = engine(&server);
        engine.login("alice", "pw").await.unwrap();
        let details = engine.fetch_run_details("alice", &scope(), "9").await.unwrap();

        assert_eq!(details.entity.field("testcycl-id"), Some("70"));
        assert_eq!(details.steps[0].get("status"), Some("Passed"));
    }

    #[tokio::test]
    async fn test_download_uses_stored_attachment_name() {
        let mut server = Server::new_async().await;
        let _handshake = mock_handshake(&mut server).await;
        let _listing = server
            .mock("GET", "/rest/domains/D/projects/P/attachments")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({"entities": [entity(&[
                    ("id", "5"),
                    ("name", "log:today?.txt"),
                    ("parent-type", "test"),
                ])]})
                .to_string(),
            )
            .create_async()
            .await;
        let _content = server
            .mock("GET", "/rest/domains/D/projects/P/attachments/5")
            .with_status(200)
            .with_body("hello")
            .create_async()
            .await;
        let _unknown = server
            .mock("GET", "/rest/domains/D/projects/P/attachments/6")
            .with_status(200)
            .with_body("other")
            .create_async()
            .await;

        let engine = engine(&server);
        engine.login("alice", "pw").await.unwrap();
        assert!(engine.sync_attachments("alice", &scope(), "test", "12").await.success);

        let named = engine.download_attachment("alice", &scope(), "5").await.unwrap();
        assert_eq!(named.file_name, "log_today_.txt");
        assert_eq!(named.bytes, b"hello");
        assert_eq!(named.content_base64(), "aGVsbG8=");

        let unnamed = engine.download_attachment("alice", &scope(), "6").await.unwrap();
        assert_eq!(unnamed.file_name, "attachment_6");
    }

    #[tokio::test]
    async fn test_auth_failure_mid_listing_keeps_its_reason() {
        let mut server = Server::new_async().await;
        let _handshake = mock_handshake(&mut server).await;
        let first: Vec<_> = (1..=100)
            .map(|id| entity(&[("id", id.to_string().as_str()), ("name", "T")]))
            .collect();
        let _p1 = server
            .mock("GET", "/rest/domains/D/projects/P/tests")
            .match_query(Matcher::UrlEncoded("start-index".into(), "1".into()))
            .with_status(200)
            .with_body(json!({ "entities": first }).to_string())
            .create_async()
            .await;
        let _p2 = server
            .mock("GET", "/rest/domains/D/projects/P/tests")
            .match_query(Matcher::UrlEncoded("start-index".into(), "101".into()))
            .with_status(401)
            .create_async()
            .await;

        let engine = engine(&server);
        engine.login("alice", "pw").await.unwrap();
        let result = engine.sync_tests("alice", &scope(), "4").await;

        assert!(!result.success);
        assert!(result.partial);
        assert_eq!(result.count, 100);
        assert!(
            result.message.starts_with("authentication required"),
            "{}",
            result.message
        );
        assert_eq!(engine.session().phase(), SessionPhase::Expired);
    }

    #[tokio::test]
    async fn test_attachments_without_parent_type_use_requested_one() {
        let mut server = Server::new_async().await;
        let _handshake = mock_handshake(&mut server).await;
        let _listing = server
            .mock("GET", "/rest/domains/D/projects/P/attachments")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({"entities": [entity(&[("id", "8"), ("name", "trace.log")])]}).to_string(),
            )
            .create_async()
            .await;

        let engine = engine(&server);
        engine.login("alice", "pw").await.unwrap();
        let result = engine.sync_attachments("alice", &scope(), "defect", "55").await;

        assert!(result.success, "{}", result.message);
        assert_eq!(result.entities[0].storage_kind, StorageKind::DefectAttachments);
        let found = engine
            .store()
            .attachments_for("alice", "default", "defect", "55")
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].parent_type.as_deref(), Some("defect"));
    }
}
