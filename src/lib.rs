//! CDATA sync language server implementation.
//!
//! Watches for XML host documents, offers to open each `<![CDATA[ ... ]]>`
//! section as its own editable file, and keeps both sides synchronized:
//! region edits are debounced and written back into the exact section they
//! came from, host edits are re-extracted and pushed out to the bound
//! region documents.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock};

use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService};

mod document;
pub(crate) mod settings;
mod sync;
mod workspace;

pub use document::{
    extract_regions, updated_host_text, LineIndex, RegionKey, Session, SessionState, SessionStore,
};
pub use settings::{discover_config, discover_settings, load_settings, HostPosition, SyncConfig};
pub use sync::{
    plan_host_edit, plan_write_back, schedule_debounced, HostEditPlan, RegionPush, WriteBackPlan,
};
pub use workspace::{materialize_region, region_file_name};

pub struct Backend {
    client: Client,
    sessions: Arc<SessionStore>,
    config: RwLock<SyncConfig>,
    workspace_root: OnceLock<PathBuf>,
}

impl Backend {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            sessions: Arc::new(SessionStore::new()),
            config: RwLock::new(SyncConfig::default()),
            workspace_root: OnceLock::new(),
        }
    }

    /// Snapshot of the current sync configuration.
    fn config(&self) -> SyncConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_config(&self, new: SyncConfig) {
        match self.config.write() {
            Ok(mut config) => *config = new,
            Err(poisoned) => *poisoned.into_inner() = new,
        }
    }

    /// An edit arrived for a bound region document: record its text and
    /// (re)start the debounce timer for that stream, under one lock
    /// acquisition so no concurrently handled edit can slip between the two.
    /// Only the content captured by the last edit before the quiet period
    /// elapses reaches the host.
    async fn on_region_edit(&self, key: RegionKey, text: String) {
        let Some(session) = self.sessions.get(&key.host) else {
            return;
        };
        let index = key.index;
        let delay = self.config().update_delay;
        let fire = {
            let client = self.client.clone();
            let session = Arc::clone(&session);
            let text = text.clone();
            async move {
                apply_write_back(client, session, index, text).await;
            }
        };

        let mut state = session.lock().await;
        state.set_region_text(index, text);
        sync::schedule_debounced(&mut state, Arc::clone(&session), index, delay, fire);
    }

    /// An edit arrived for a tracked host document: refresh the snapshot and
    /// push re-extracted contents out to the bound region documents, unless
    /// the edit was our own write coming back to us.
    async fn on_host_edit(&self, session: Arc<Session>, text: String, version: i32) {
        let plan = {
            let mut state = session.lock().await;
            sync::plan_host_edit(&mut state, text, version)
        };

        match plan {
            HostEditPlan::SelfOriginated => {}
            HostEditPlan::CountMismatch { expected, found } => {
                self.client
                    .log_message(
                        MessageType::WARNING,
                        format!(
                            "{}: region count changed ({} -> {}); host edits are no longer forwarded",
                            session.host_uri, expected, found
                        ),
                    )
                    .await;
            }
            HostEditPlan::Push(pushes) => {
                for push in pushes {
                    apply_region_push(&self.client, &session, push).await;
                }
            }
        }
    }
}

/// Replace a document's entire content via `workspace/applyEdit`.
fn full_replace_edit(uri: Url, current_text: &str, new_text: String) -> WorkspaceEdit {
    let range = LineIndex::new(current_text.to_string()).full_range();
    let mut changes = HashMap::new();
    changes.insert(uri, vec![TextEdit::new(range, new_text)]);
    WorkspaceEdit {
        changes: Some(changes),
        ..Default::default()
    }
}

/// Fire a debounced region -> host write-back.
///
/// The host text is read fresh under the session lock at fire time, never
/// from a snapshot captured when the timer was scheduled, so two regions
/// firing close together cannot lose each other's update. The lock is held
/// across the apply so the snapshot and the origin tag stay consistent with
/// what the client saw.
async fn apply_write_back(client: Client, session: Arc<Session>, index: usize, content: String) {
    let mut state = session.lock().await;

    match sync::plan_write_back(&state, index, &content) {
        WriteBackPlan::Unbound | WriteBackPlan::Unchanged => {}
        WriteBackPlan::CountMismatch { expected, found } => {
            drop(state);
            client
                .log_message(
                    MessageType::WARNING,
                    format!(
                        "{}: dropping edit for region {}: host now has {} regions, expected {}",
                        session.host_uri, index, found, expected
                    ),
                )
                .await;
        }
        WriteBackPlan::Apply(new_host) => {
            let edit = full_replace_edit(
                session.host_uri.clone(),
                &state.host_text,
                new_host.clone(),
            );
            match client.apply_edit(edit).await {
                Ok(response) if response.applied => {
                    state.host_text = new_host.clone();
                    state.last_self_write = Some(new_host);
                    state.set_region_text(index, content);
                }
                Ok(_) | Err(_) => {
                    // The client refused, most likely because the host was
                    // closed between scheduling and firing. Dropped, not
                    // retried.
                    eprintln!(
                        "[sync] host write for region {} of {} not applied",
                        index, session.host_uri
                    );
                }
            }
        }
    }
}

/// Push freshly extracted host content into one bound region document.
async fn apply_region_push(client: &Client, session: &Arc<Session>, push: RegionPush) {
    let mut state = session.lock().await;

    // Re-validate under the lock; the region may have closed in between.
    if state.binding(push.index).is_none() {
        return;
    }
    let current = state.region_text(push.index).unwrap_or("").to_string();

    let edit = full_replace_edit(push.region_uri.clone(), &current, push.content.clone());
    match client.apply_edit(edit).await {
        Ok(response) if response.applied => {
            state.set_region_text(push.index, push.content);
        }
        Ok(_) | Err(_) => {
            eprintln!(
                "[sync] push to region {} of {} not applied",
                push.index, session.host_uri
            );
        }
    }
}

/// Ask the user whether to open the host's CDATA sections as separate
/// documents and, on consent, materialize and show one region document per
/// section. Runs as its own task so notification handling never waits on
/// the prompt.
async fn offer_session(
    client: Client,
    sessions: Arc<SessionStore>,
    config: SyncConfig,
    workspace_root: Option<PathBuf>,
    host_uri: Url,
    host_text: String,
    version: i32,
) {
    let actions = vec![
        MessageActionItem {
            title: "Yes".to_string(),
            properties: Default::default(),
        },
        MessageActionItem {
            title: "No".to_string(),
            properties: Default::default(),
        },
    ];
    let choice = client
        .show_message_request(
            MessageType::INFO,
            "Open the CDATA sections of this document as separate editable files?".to_string(),
            Some(actions),
        )
        .await;

    // Decline and no answer both leave the document untracked.
    let accepted = matches!(&choice, Ok(Some(item)) if item.title == "Yes");
    if !accepted {
        return;
    }

    let contents = document::extract_regions(&host_text);
    if contents.is_empty() {
        client
            .log_message(
                MessageType::INFO,
                format!("{}: no CDATA sections found", host_uri),
            )
            .await;
        return;
    }

    let Some(root) = workspace_root else {
        client
            .show_message(
                MessageType::ERROR,
                "Cannot create CDATA section files without a workspace folder",
            )
            .await;
        return;
    };

    let session = Arc::new(Session::new(
        host_uri.clone(),
        host_text,
        version,
        contents.len(),
    ));
    sessions.insert(Arc::clone(&session));
    client
        .log_message(
            MessageType::INFO,
            open_announcement(&host_uri, contents.len(), &config),
        )
        .await;

    for (index, content) in contents.iter().enumerate() {
        let file_name = workspace::region_file_name(index, &config.extension);
        let path = match workspace::materialize_region(&root, index, &config.extension, content) {
            Ok(path) => path,
            Err(err) => {
                // Partial failure is fine: this region stays closed, the
                // others proceed.
                client
                    .show_message(
                        MessageType::ERROR,
                        format!("Failed to create file: {} ({})", file_name, err),
                    )
                    .await;
                continue;
            }
        };

        let Ok(region_uri) = Url::from_file_path(&path) else {
            client
                .show_message(
                    MessageType::ERROR,
                    format!("Failed to create file: {}", file_name),
                )
                .await;
            continue;
        };

        {
            let mut state = session.lock().await;
            state.bind(index, region_uri.clone());
            state.set_region_text(index, content.clone());
        }
        sessions.index_region(
            region_uri.clone(),
            RegionKey {
                host: host_uri.clone(),
                index,
            },
        );

        let shown = client
            .show_document(ShowDocumentParams {
                uri: region_uri,
                external: Some(false),
                take_focus: Some(false),
                selection: None,
            })
            .await;
        if let Err(err) = shown {
            eprintln!("[open] could not show {}: {}", file_name, err);
        }
    }

    // Re-show the host after the regions so clients that honor the hint
    // move it to the last group. The delay gives the region views time to
    // settle first.
    if config.host_position == HostPosition::Last {
        tokio::time::sleep(config.open_delay).await;
        let _ = client
            .show_document(ShowDocumentParams {
                uri: host_uri,
                external: Some(false),
                take_focus: Some(false),
                selection: None,
            })
            .await;
    }
}

/// Log line announcing an accepted session. The configured language name is
/// surfaced here; the actual editor mode comes from the region files'
/// extension.
fn open_announcement(host_uri: &Url, count: usize, config: &SyncConfig) -> String {
    format!(
        "{}: opening {} CDATA section(s) as {} (.{}) documents",
        host_uri, count, config.language, config.extension
    )
}

/// Check if a document is in the tracked host format.
fn is_host_document(language_id: &str, uri: &Url) -> bool {
    language_id == "xml" || uri.path().ends_with(".xml")
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        // Extract workspace root from params
        let workspace_root = params
            .workspace_folders
            .as_ref()
            .and_then(|folders| folders.first())
            .and_then(|f| f.uri.to_file_path().ok())
            .or_else(|| {
                #[allow(deprecated)]
                params.root_uri.as_ref()?.to_file_path().ok()
            });

        if let Some(root) = workspace_root {
            let _ = self.workspace_root.set(root.clone());
            self.set_config(settings::discover_config(&root));
        }

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::FULL,
                )),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        self.client
            .log_message(MessageType::INFO, "CDATA sync language server initialized")
            .await;
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let doc = params.text_document;

        // The client opening one of our region files reports its content;
        // keep the record fresh but never prompt for it.
        if let Some(key) = self.sessions.region_key(&doc.uri) {
            if let Some(session) = self.sessions.get(&key.host) {
                session.lock().await.set_region_text(key.index, doc.text);
            }
            return;
        }

        if !is_host_document(&doc.language_id, &doc.uri) || self.sessions.contains(&doc.uri) {
            return;
        }

        tokio::spawn(offer_session(
            self.client.clone(),
            Arc::clone(&self.sessions),
            self.config(),
            self.workspace_root.get().cloned(),
            doc.uri,
            doc.text,
            doc.version,
        ));
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        // We use FULL sync, so there's exactly one change with the full text
        let Some(change) = params.content_changes.into_iter().next() else {
            return;
        };
        let uri = params.text_document.uri;
        let version = params.text_document.version;

        if let Some(key) = self.sessions.region_key(&uri) {
            self.on_region_edit(key, change.text).await;
        } else if let Some(session) = self.sessions.get(&uri) {
            self.on_host_edit(session, change.text, version).await;
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;

        if let Some(key) = self.sessions.close_region(&uri).await {
            eprintln!("[close] region {} of {} orphaned", key.index, key.host);
            return;
        }

        if self.sessions.contains(&uri) {
            self.sessions.close_host(&uri).await;
            eprintln!("[close] host {} untracked", uri);
        }
    }

    async fn did_change_configuration(&self, _: DidChangeConfigurationParams) {
        let Some(root) = self.workspace_root.get() else {
            return;
        };
        let new = settings::discover_config(root);
        if new != self.config() {
            self.set_config(new);
            self.client
                .log_message(MessageType::INFO, "sync settings reloaded")
                .await;
        }
    }
}

pub fn create_service() -> (LspService<Backend>, tower_lsp::ClientSocket) {
    LspService::new(Backend::new)
}
