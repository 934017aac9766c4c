//! Edit propagation between host documents and their region documents.
//!
//! The planning functions here are pure state transitions so the sync policy
//! can be tested without an LSP client: the `Backend` turns the returned
//! plans into `workspace/applyEdit` requests. Debounce scheduling lives here
//! too; each region stream owns at most one timer, and rescheduling aborts
//! the previous one so only the latest content survives the quiet period.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tower_lsp::lsp_types::Url;

use crate::document::{extract_regions, updated_host_text, Session, SessionState};

/// One push of freshly extracted content into a bound region document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionPush {
    pub index: usize,
    pub region_uri: Url,
    pub content: String,
}

/// Outcome of a host document edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEditPlan {
    /// The edit is the echo of a write this server just made; the snapshot
    /// was refreshed and nothing must be pushed back out.
    SelfOriginated,
    /// The edit changed the number of regions, so ordinal indices can no
    /// longer be trusted. Nothing is pushed.
    CountMismatch { expected: usize, found: usize },
    /// Push each entry into its bound region document.
    Push(Vec<RegionPush>),
}

/// Apply a host document edit to the session state and decide what, if
/// anything, flows out to the region documents.
///
/// The host text snapshot is always refreshed, whatever the outcome, so a
/// later write-back reads the freshest host text.
pub fn plan_host_edit(state: &mut SessionState, new_text: String, version: i32) -> HostEditPlan {
    state.version = version;

    if state.last_self_write.as_deref() == Some(new_text.as_str()) {
        state.host_text = new_text;
        state.last_self_write = None;
        return HostEditPlan::SelfOriginated;
    }

    state.host_text = new_text;
    let contents = extract_regions(&state.host_text);

    if contents.len() != state.bindings.len() {
        return HostEditPlan::CountMismatch {
            expected: state.bindings.len(),
            found: contents.len(),
        };
    }

    let pushes = contents
        .into_iter()
        .enumerate()
        .filter_map(|(index, content)| {
            let uri = state.binding(index)?;
            // Rewriting a region with text it already holds would only
            // disturb the user's cursor and bounce another change event back.
            if state.region_text(index) == Some(content.as_str()) {
                return None;
            }
            Some(RegionPush {
                index,
                region_uri: uri.clone(),
                content,
            })
        })
        .collect();

    HostEditPlan::Push(pushes)
}

/// Outcome of a region -> host write-back attempt at debounce fire time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteBackPlan {
    /// The region document was closed between scheduling and firing.
    Unbound,
    /// The host's region count has drifted from the count at extraction
    /// time; writing by ordinal index would misattribute the edit.
    CountMismatch { expected: usize, found: usize },
    /// The host already contains this content.
    Unchanged,
    /// Replace the host document's full text with the payload.
    Apply(String),
}

/// Decide the write-back for a region edit, reading the host text fresh from
/// the session state (never from a snapshot captured at schedule time).
pub fn plan_write_back(state: &SessionState, index: usize, content: &str) -> WriteBackPlan {
    if state.binding(index).is_none() {
        return WriteBackPlan::Unbound;
    }

    let found = extract_regions(&state.host_text).len();
    if found != state.bindings.len() {
        return WriteBackPlan::CountMismatch {
            expected: state.bindings.len(),
            found,
        };
    }

    let new_host = updated_host_text(&state.host_text, content, index);
    if new_host == state.host_text {
        return WriteBackPlan::Unchanged;
    }

    WriteBackPlan::Apply(new_host)
}

/// (Re)start the debounce timer for one region stream.
///
/// Any timer already pending for the stream is aborted and replaced, so a
/// burst of edits fires `on_elapsed` exactly once, after the quiet period,
/// with whatever the caller captured last.
///
/// Takes the caller's state guard: recording the captured content and
/// installing the timer that carries it must be one critical section.
/// Notification handlers run concurrently, and a registration done under a
/// second lock acquisition could land after a later edit's, reviving stale
/// content.
pub fn schedule_debounced<Fut>(
    state: &mut SessionState,
    session: Arc<Session>,
    index: usize,
    delay: Duration,
    on_elapsed: Fut,
) where
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        session.lock().await.clear_timer(index);
        on_elapsed.await;
    });
    state.replace_timer(index, handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SessionStore;
    use std::sync::Mutex;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn session_with_bindings(host_text: &str, bindings: &[Option<&str>]) -> Session {
        let session = Session::new(
            url("file:///p/host.xml"),
            host_text.to_string(),
            0,
            bindings.len(),
        );
        {
            let mut state = session.lock().await;
            for (i, b) in bindings.iter().enumerate() {
                if let Some(u) = b {
                    state.bind(i, url(u));
                }
            }
        }
        session
    }

    // -- plan_host_edit ----------------------------------------------------

    #[tokio::test]
    async fn host_edit_pushes_to_bound_regions() {
        let session = session_with_bindings(
            "<a><![CDATA[x]]></a><b><![CDATA[y]]></b>",
            &[Some("file:///p/region_0.js"), Some("file:///p/region_1.js")],
        ).await;
        let mut state = session.lock().await;

        let plan = plan_host_edit(
            &mut state,
            "<a><![CDATA[x2]]></a><b><![CDATA[y2]]></b>".to_string(),
            1,
        );

        assert_eq!(
            plan,
            HostEditPlan::Push(vec![
                RegionPush {
                    index: 0,
                    region_uri: url("file:///p/region_0.js"),
                    content: "x2".to_string(),
                },
                RegionPush {
                    index: 1,
                    region_uri: url("file:///p/region_1.js"),
                    content: "y2".to_string(),
                },
            ])
        );
        assert_eq!(state.version, 1);
    }

    #[tokio::test]
    async fn host_edit_skips_orphaned_slots() {
        let session = session_with_bindings(
            "<a><![CDATA[x]]></a><b><![CDATA[y]]></b>",
            &[None, Some("file:///p/region_1.js")],
        ).await;
        let mut state = session.lock().await;

        let plan = plan_host_edit(
            &mut state,
            "<a><![CDATA[x2]]></a><b><![CDATA[y2]]></b>".to_string(),
            1,
        );

        assert_eq!(
            plan,
            HostEditPlan::Push(vec![RegionPush {
                index: 1,
                region_uri: url("file:///p/region_1.js"),
                content: "y2".to_string(),
            }])
        );
    }

    #[tokio::test]
    async fn host_edit_does_not_push_content_a_region_already_holds() {
        let session = session_with_bindings(
            "<a><![CDATA[x]]></a><b><![CDATA[y]]></b>",
            &[Some("file:///p/region_0.js"), Some("file:///p/region_1.js")],
        ).await;
        let mut state = session.lock().await;
        state.set_region_text(0, "x".to_string());
        state.set_region_text(1, "y".to_string());

        // Only the second region actually changed.
        let plan = plan_host_edit(
            &mut state,
            "<a><![CDATA[x]]></a><b><![CDATA[y2]]></b>".to_string(),
            1,
        );

        assert_eq!(
            plan,
            HostEditPlan::Push(vec![RegionPush {
                index: 1,
                region_uri: url("file:///p/region_1.js"),
                content: "y2".to_string(),
            }])
        );
    }

    #[tokio::test]
    async fn self_originated_host_edit_is_suppressed() {
        let session = session_with_bindings(
            "<a><![CDATA[x]]></a>",
            &[Some("file:///p/region_0.js")],
        ).await;
        let mut state = session.lock().await;
        let written = "<a><![CDATA[edited]]></a>".to_string();
        state.last_self_write = Some(written.clone());

        let plan = plan_host_edit(&mut state, written.clone(), 2);

        assert_eq!(plan, HostEditPlan::SelfOriginated);
        assert_eq!(state.host_text, written);
        // The tag is one-shot: the next identical text is treated as external.
        assert_eq!(state.last_self_write, None);
    }

    #[tokio::test]
    async fn host_edit_with_drifted_region_count_pushes_nothing() {
        let session = session_with_bindings(
            "<a><![CDATA[x]]></a><b><![CDATA[y]]></b>",
            &[Some("file:///p/region_0.js"), Some("file:///p/region_1.js")],
        ).await;
        let mut state = session.lock().await;

        // The user deleted the second region entirely.
        let plan = plan_host_edit(&mut state, "<a><![CDATA[x]]></a>".to_string(), 1);

        assert_eq!(
            plan,
            HostEditPlan::CountMismatch {
                expected: 2,
                found: 1,
            }
        );
        // Snapshot is still refreshed so later write-backs see reality.
        assert_eq!(state.host_text, "<a><![CDATA[x]]></a>");
    }

    // -- plan_write_back ---------------------------------------------------

    #[tokio::test]
    async fn write_back_replaces_only_the_edited_region() {
        let session = session_with_bindings(
            "<root><item><![CDATA[A]]></item><item><![CDATA[B]]></item></root>",
            &[Some("file:///p/region_0.js"), Some("file:///p/region_1.js")],
        ).await;
        let state = session.lock().await;

        let plan = plan_write_back(&state, 1, "B2");

        assert_eq!(
            plan,
            WriteBackPlan::Apply(
                "<root><item><![CDATA[A]]></item><item><![CDATA[B2]]></item></root>".to_string()
            )
        );
    }

    #[tokio::test]
    async fn write_back_to_an_orphaned_slot_is_dropped() {
        let session = session_with_bindings("<a><![CDATA[x]]></a>", &[None]).await;
        let state = session.lock().await;
        assert_eq!(plan_write_back(&state, 0, "new"), WriteBackPlan::Unbound);
    }

    #[tokio::test]
    async fn write_back_refused_when_region_count_drifted() {
        // Two bindings were recorded at extraction time, but the host now
        // holds a single region.
        let session = session_with_bindings(
            "<a><![CDATA[x]]></a>",
            &[Some("file:///p/region_0.js"), Some("file:///p/region_1.js")],
        ).await;
        let state = session.lock().await;

        assert_eq!(
            plan_write_back(&state, 0, "new"),
            WriteBackPlan::CountMismatch {
                expected: 2,
                found: 1,
            }
        );
    }

    #[tokio::test]
    async fn write_back_of_identical_content_is_unchanged() {
        let session =
            session_with_bindings("<a><![CDATA[same]]></a>", &[Some("file:///p/region_0.js")]).await;
        let state = session.lock().await;
        assert_eq!(plan_write_back(&state, 0, "same"), WriteBackPlan::Unchanged);
    }

    // -- debounce ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_collapse_to_one_fire_with_final_content() {
        let session = Arc::new(Session::new(
            url("file:///p/host.xml"),
            String::new(),
            0,
            1,
        ));
        let fired: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let delay = Duration::from_millis(1500);

        for content in ["first", "second", "final"] {
            let fired = Arc::clone(&fired);
            let mut state = session.lock().await;
            schedule_debounced(&mut state, Arc::clone(&session), 0, delay, async move {
                fired.lock().unwrap().push(content);
            });
        }

        tokio::time::sleep(delay * 2).await;

        assert_eq!(*fired.lock().unwrap(), vec!["final"]);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_quiet_periods_fire_separately() {
        let session = Arc::new(Session::new(
            url("file:///p/host.xml"),
            String::new(),
            0,
            1,
        ));
        let fired: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let delay = Duration::from_millis(100);

        for content in ["first", "second"] {
            let fired = Arc::clone(&fired);
            {
                let mut state = session.lock().await;
                schedule_debounced(&mut state, Arc::clone(&session), 0, delay, async move {
                    fired.lock().unwrap().push(content);
                });
            }
            tokio::time::sleep(delay * 2).await;
        }

        assert_eq!(*fired.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timers_on_different_streams_are_independent() {
        let session = Arc::new(Session::new(
            url("file:///p/host.xml"),
            String::new(),
            0,
            2,
        ));
        let fired: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let delay = Duration::from_millis(100);

        for index in [0usize, 1] {
            let fired = Arc::clone(&fired);
            let mut state = session.lock().await;
            schedule_debounced(&mut state, Arc::clone(&session), index, delay, async move {
                fired.lock().unwrap().push(index);
            });
        }

        tokio::time::sleep(delay * 2).await;

        let mut result = fired.lock().unwrap().clone();
        result.sort_unstable();
        assert_eq!(result, vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn unbinding_cancels_the_pending_timer() {
        let session = Arc::new(Session::new(
            url("file:///p/host.xml"),
            String::new(),
            0,
            1,
        ));
        session.lock().await.bind(0, url("file:///p/region_0.js"));

        let fired = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let delay = Duration::from_millis(100);
        {
            let fired = Arc::clone(&fired);
            let mut state = session.lock().await;
            schedule_debounced(&mut state, Arc::clone(&session), 0, delay, async move {
                fired.lock().unwrap().push("should not fire");
            });
        }

        session.lock().await.unbind(0);
        tokio::time::sleep(delay * 2).await;

        assert!(fired.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_host_cancels_pending_timers() {
        let store = SessionStore::new();
        let host = url("file:///p/host.xml");
        let session = Arc::new(Session::new(host.clone(), String::new(), 0, 1));
        session.lock().await.bind(0, url("file:///p/region_0.js"));
        store.insert(Arc::clone(&session));

        let fired = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let delay = Duration::from_millis(100);
        {
            let fired = Arc::clone(&fired);
            let mut state = session.lock().await;
            schedule_debounced(&mut state, Arc::clone(&session), 0, delay, async move {
                fired.lock().unwrap().push("should not fire");
            });
        }

        store.close_host(&host).await;
        tokio::time::sleep(delay * 2).await;

        assert!(fired.lock().unwrap().is_empty());
    }

    // Two concurrently handled edits for the same region: whichever wins the
    // lock last must end up with both the recorded text and the live timer,
    // never a mix of one edit's text and the other's timer.
    #[tokio::test(start_paused = true)]
    async fn concurrent_edits_keep_recorded_text_and_timer_paired() {
        let session = Arc::new(Session::new(
            url("file:///p/host.xml"),
            String::new(),
            0,
            1,
        ));
        session.lock().await.bind(0, url("file:///p/region_0.js"));

        let fired = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let delay = Duration::from_millis(100);

        let mut handlers = Vec::new();
        for content in ["draft", "final"] {
            let session = Arc::clone(&session);
            let fired = Arc::clone(&fired);
            handlers.push(tokio::spawn(async move {
                let mut state = session.lock().await;
                state.set_region_text(0, content.to_string());
                let fired = Arc::clone(&fired);
                schedule_debounced(&mut state, Arc::clone(&session), 0, delay, async move {
                    fired.lock().unwrap().push(content);
                });
            }));
        }
        for handler in handlers {
            handler.await.unwrap();
        }

        tokio::time::sleep(delay * 2).await;

        let fired = fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        assert_eq!(session.lock().await.region_text(0), Some(fired[0]));
    }
}
