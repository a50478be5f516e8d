use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use weak_table::WeakValueHashMap;

use crate::device::OutputDevice;
use crate::error::{AudioError, Result};
use crate::ledger::{UsageLedger, UsageSnapshot};
use crate::session::{ClientHandle, Session};
use crate::sink::CaptureSink;

struct RegistryInner {
    sessions: WeakValueHashMap<i32, std::sync::Weak<Session>>,
    next_conn_id: i32,
}

/// Owner of all live sessions. Holds sessions strongly only through the
/// handles it gives out; once every external handle is dropped the entry
/// falls out of the table on its own.
pub struct Registry {
    device: Arc<dyn OutputDevice>,
    ledger: Arc<UsageLedger>,
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        Self {
            device,
            ledger: Arc::new(UsageLedger::new()),
            inner: Mutex::new(RegistryInner {
                sessions: WeakValueHashMap::new(),
                next_conn_id: 1,
            }),
        }
    }

    /// Admit a new client connection and hand back its session.
    pub fn create_session(
        &self,
        client: ClientHandle,
        uid: u32,
        pid: u32,
        audio_session_id: i32,
    ) -> Arc<Session> {
        let mut inner = self.inner.lock().unwrap();
        let conn_id = inner.next_conn_id;
        inner.next_conn_id += 1;
        let session = Arc::new(Session::new(
            conn_id,
            audio_session_id,
            uid,
            pid,
            client,
            self.device.clone(),
            self.ledger.clone(),
        ));
        inner.sessions.insert(conn_id, session.clone());
        info!(conn = conn_id, uid, pid, audio_session_id, "session created");
        session
    }

    pub fn session(&self, conn_id: i32) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().sessions.get(&conn_id)
    }

    /// Explicit client disconnect: tear the session down immediately rather
    /// than waiting for its handles to lapse.
    pub fn disconnect(&self, conn_id: i32) -> Result<()> {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            let session = inner.sessions.get(&conn_id).ok_or(AudioError::State {
                op: "disconnect",
                state: "unknown connection",
            })?;
            inner.sessions.remove(&conn_id);
            session
        };
        session.teardown();
        info!(conn = conn_id, "session disconnected");
        Ok(())
    }

    /// Tear down every session whose client endpoint has gone away.
    /// Returns how many were reaped.
    pub fn reap(&self) -> usize {
        let dead: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock().unwrap();
            let dead: Vec<Arc<Session>> = inner
                .sessions
                .iter()
                .filter(|(_, s)| !s.client_alive())
                .map(|(_, s)| s)
                .collect();
            for session in &dead {
                inner.sessions.remove(&session.conn_id());
            }
            dead
        };
        for session in &dead {
            debug!(conn = session.conn_id(), "reaping session with dead client");
            session.teardown();
        }
        dead.len()
    }

    /// A standalone capture sink, not tied to any session.
    pub fn create_capture_sink(&self) -> Arc<CaptureSink> {
        Arc::new(CaptureSink::new())
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    /// Settle and drain accumulated usage, as for a periodic statistics pull.
    pub fn pull_usage(&self) -> Vec<UsageSnapshot> {
        self.ledger.pull()
    }

    pub fn active_sessions(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.iter().map(|(_, s)| s).collect()
    }
}
