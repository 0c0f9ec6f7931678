//! Session and stream registries
//!
//! `sessions` maps a session token to the client's control socket and the public
//! streams opened under it. `streams` is the reverse index from stream name to the
//! owning session, used to route late DATA_FROM_APP2 frames right after a resume.
//! A session outlives its control socket: once the socket is gone the session is
//! unroutable until a RESUME rebinds it. The next public connection that touches it
//! prunes its closed streams and drops the session once none are left.

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;
use tunnelforge_common::{FrameSender, current_timestamp_millis};

/// Sender feeding the writer task of a public socket
pub type PublicSender = mpsc::Sender<Bytes>;

/// Server-side state of one client session
#[derive(Debug)]
pub struct Session {
    control: FrameSender,
    streams: HashMap<String, PublicSender>,
    created_at: u64,
}

impl Session {
    fn new(control: FrameSender) -> Self {
        Self {
            control,
            streams: HashMap::new(),
            created_at: current_timestamp_millis(),
        }
    }

    /// Drop closed streams, returning their names
    fn prune_closed_streams(&mut self) -> Vec<String> {
        let closed: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, tx)| tx.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &closed {
            self.streams.remove(name);
        }
        closed
    }
}

#[derive(Debug, Clone)]
struct StreamRoute {
    token: String,
    tx: PublicSender,
}

/// Why a public connection could not be routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    UnknownSession,
    ControlClosed,
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::UnknownSession => write!(f, "no session registered for this subdomain"),
            RouteError::ControlClosed => write!(f, "session control connection is closed"),
        }
    }
}

/// Snapshot of a session for observability
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub token: String,
    pub created_at: u64,
    pub streams: usize,
    pub control_alive: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    sessions: DashMap<String, Session>,
    streams: DashMap<String, StreamRoute>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `control` as the session's control socket, creating the session if needed.
    ///
    /// The previous socket, if any, is considered defunct and is not closed here.
    /// Returns `true` when an existing session was rebound.
    pub fn bind_control(&self, token: &str, control: FrameSender) -> bool {
        let mut resumed = false;
        self.sessions
            .entry(token.to_string())
            .and_modify(|session| {
                session.control = control.clone();
                resumed = true;
            })
            .or_insert_with(|| Session::new(control));
        resumed
    }

    /// Attach a public stream to the session owning `token`.
    ///
    /// Idempotent for a given stream name. Returns the session's control socket.
    pub fn route_public(
        &self,
        token: &str,
        name: &str,
        tx: &PublicSender,
    ) -> Result<FrameSender, RouteError> {
        {
            let mut session = self
                .sessions
                .get_mut(token)
                .ok_or(RouteError::UnknownSession)?;

            if !session.control.is_closed() {
                session
                    .streams
                    .entry(name.to_string())
                    .or_insert_with(|| tx.clone());
                let control = session.control.clone();
                drop(session);

                self.streams
                    .entry(name.to_string())
                    .or_insert_with(|| StreamRoute {
                        token: token.to_string(),
                        tx: tx.clone(),
                    });
                return Ok(control);
            }
        }

        self.collect_dead_session(token);
        Err(RouteError::ControlClosed)
    }

    /// Prune a session whose control socket is gone
    ///
    /// Closed streams are dropped from both maps. The session itself is removed once
    /// no live stream is left; live streams keep it so a RESUME can pick them up.
    fn collect_dead_session(&self, token: &str) {
        let pruned = match self.sessions.get_mut(token) {
            Some(mut session) if session.control.is_closed() => session.prune_closed_streams(),
            _ => return,
        };
        for name in &pruned {
            self.streams.remove_if(name, |_, route| route.token == token);
        }

        let removed = self.sessions.remove_if(token, |_, session| {
            session.control.is_closed() && session.streams.is_empty()
        });
        debug!(
            token = %token,
            pruned = pruned.len(),
            removed = removed.is_some(),
            "Collected dead session"
        );
    }

    /// Find the public socket of a stream, falling back to the global index
    pub fn lookup_stream(&self, token: &str, name: &str) -> Option<PublicSender> {
        let in_session = self
            .sessions
            .get(token)
            .and_then(|session| session.streams.get(name).cloned());

        in_session.or_else(|| self.streams.get(name).map(|route| route.tx.clone()))
    }

    /// Session owning a stream according to the global index
    #[cfg(test)]
    fn stream_owner(&self, name: &str) -> Option<String> {
        self.streams.get(name).map(|route| route.token.clone())
    }

    /// Remove a stream from its session and from the global index
    pub fn remove_stream(&self, token: &str, name: &str) {
        if let Some(mut session) = self.sessions.get_mut(token) {
            session.streams.remove(name);
        }
        self.streams.remove(name);
    }

    #[cfg(test)]
    fn control_for(&self, token: &str) -> Option<FrameSender> {
        self.sessions
            .get(token)
            .map(|session| session.control.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|entry| SessionSummary {
                token: entry.key().clone(),
                created_at: entry.created_at,
                streams: entry.streams.len(),
                control_alive: !entry.control.is_closed(),
            })
            .collect()
    }

    /// Drop every session and stream, releasing all socket handles
    pub fn clear(&self) {
        self.sessions.clear();
        self.streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelforge_common::spawn_frame_writer;

    fn control() -> (FrameSender, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (sender, _) = spawn_frame_writer(ours, 8);
        (sender, theirs)
    }

    #[tokio::test]
    async fn test_bind_control_creates_then_resumes() {
        let registry = Registry::new();
        let (first, _peer1) = control();
        let (second, _peer2) = control();

        assert!(!registry.bind_control("tok", first.clone()));
        assert!(registry.bind_control("tok", second.clone()));
        assert_eq!(registry.session_count(), 1);
        assert!(registry.control_for("tok").unwrap().same_channel(&second));
    }

    #[tokio::test]
    async fn test_route_unknown_session() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(
            registry.route_public("missing", "s1", &tx).unwrap_err(),
            RouteError::UnknownSession
        );
        assert_eq!(registry.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_route_registers_stream_idempotently() {
        let registry = Registry::new();
        let (ctl, _peer) = control();
        registry.bind_control("tok", ctl);

        let (tx, _rx) = mpsc::channel(1);
        registry.route_public("tok", "s1", &tx).unwrap();
        registry.route_public("tok", "s1", &tx).unwrap();

        assert_eq!(registry.stream_count(), 1);
        assert_eq!(registry.sessions()[0].streams, 1);
        assert_eq!(registry.stream_owner("s1").as_deref(), Some("tok"));
        assert!(registry.lookup_stream("tok", "s1").is_some());
    }

    async fn dead_control() -> FrameSender {
        let (ours, _theirs) = tokio::io::duplex(64);
        let (ctl, writer) = spawn_frame_writer(ours, 8);
        writer.abort();
        let _ = writer.await;
        ctl
    }

    #[tokio::test]
    async fn test_route_rejects_closed_control() {
        let registry = Registry::new();
        registry.bind_control("tok", dead_control().await);
        assert!(!registry.sessions()[0].control_alive);

        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(
            registry.route_public("tok", "s1", &tx).unwrap_err(),
            RouteError::ControlClosed
        );
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_sessions_are_collected_on_access() {
        let registry = Registry::new();
        for i in 0..50 {
            registry.bind_control(&format!("tok{}", i), dead_control().await);
        }
        assert_eq!(registry.session_count(), 50);

        let (tx, _rx) = mpsc::channel(1);
        for i in 0..50 {
            let result = registry.route_public(&format!("tok{}", i), &format!("s{}", i), &tx);
            assert_eq!(result.unwrap_err(), RouteError::ControlClosed);
        }
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_session_with_open_stream_survives_until_resume() {
        let registry = Registry::new();
        let (ours, _theirs) = tokio::io::duplex(64);
        let (ctl, writer) = spawn_frame_writer(ours, 8);
        registry.bind_control("tok", ctl);

        let (open_tx, _open_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = mpsc::channel(1);
        registry.route_public("tok", "open", &open_tx).unwrap();
        registry.route_public("tok", "closed", &closed_tx).unwrap();
        drop(closed_rx);

        writer.abort();
        let _ = writer.await;

        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(
            registry.route_public("tok", "s3", &tx).unwrap_err(),
            RouteError::ControlClosed
        );
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.stream_owner("closed"), None);
        assert_eq!(registry.stream_owner("open").as_deref(), Some("tok"));

        // A RESUME rebinds the session and the open stream routes again
        let (second, _peer) = control();
        assert!(registry.bind_control("tok", second));
        assert!(registry.lookup_stream("tok", "open").is_some());
    }

    #[tokio::test]
    async fn test_resume_after_collection_starts_fresh() {
        let registry = Registry::new();
        registry.bind_control("tok", dead_control().await);

        let (tx, _rx) = mpsc::channel(1);
        assert!(registry.route_public("tok", "s1", &tx).is_err());

        let (ctl, _peer) = control();
        assert!(!registry.bind_control("tok", ctl));
        registry.route_public("tok", "s2", &tx).unwrap();
        assert_eq!(registry.stream_owner("s2").as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_global_index() {
        let registry = Registry::new();
        let (ctl, _peer) = control();
        registry.bind_control("old", ctl);

        let (tx, _rx) = mpsc::channel(1);
        registry.route_public("old", "s1", &tx).unwrap();

        // A frame tagged with another token still reaches the stream
        assert!(registry.lookup_stream("new", "s1").is_some());
        assert!(registry.lookup_stream("new", "s2").is_none());
    }

    #[tokio::test]
    async fn test_remove_stream_clears_both_maps() {
        let registry = Registry::new();
        let (ctl, _peer) = control();
        registry.bind_control("tok", ctl);

        let (tx, _rx) = mpsc::channel(1);
        registry.route_public("tok", "s1", &tx).unwrap();
        registry.remove_stream("tok", "s1");

        assert!(registry.lookup_stream("tok", "s1").is_none());
        assert_eq!(registry.stream_count(), 0);
        assert_eq!(registry.sessions()[0].streams, 0);
    }

    #[tokio::test]
    async fn test_resume_keeps_streams() {
        let registry = Registry::new();
        let (first, _peer1) = control();
        registry.bind_control("tok", first);

        let (tx, _rx) = mpsc::channel(1);
        registry.route_public("tok", "s1", &tx).unwrap();

        let (second, _peer2) = control();
        registry.bind_control("tok", second);
        assert!(registry.lookup_stream("tok", "s1").is_some());
    }
}
