//! Client for HAProxy's runtime API.
//!
//! The runtime socket is line-oriented: one command per connection,
//! response lines until EOF. Backend membership is managed through the
//! pre-declared server-template slots of the `nodes` backend.

mod state;

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

pub use state::{
    parse_server_state, SlotState, SlotTable, SERVER_STATE_FIELDS, SRV_ADMIN_STATE_READY,
    SRV_OP_STATE_RUNNING, STATE_FORMAT_VERSION,
};

/// Port the managed HAProxy instances expose their runtime socket on.
pub const RUNTIME_PORT: u16 = 9000;

/// The single backend holding the slot pool.
pub const BACKEND: &str = "nodes";

const EXEC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HaproxyError {
    #[error("haproxy i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("haproxy runtime command timed out after {0:?}")]
    Timeout(Duration),

    #[error("haproxy protocol error: {0}")]
    Protocol(String),

    #[error("unsupported server-state format version {0:?}")]
    UnsupportedVersion(String),

    #[error("no free slot in backend {backend}")]
    NoFreeSlot { backend: String },
}

pub type HaproxyResult<T> = Result<T, HaproxyError>;

/// Line-oriented TCP client for one HAProxy runtime socket.
#[derive(Debug, Clone)]
pub struct RuntimeClient {
    addr: String,
    timeout: Duration,
}

impl RuntimeClient {
    /// `addr` is `host:port` of the runtime socket.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: EXEC_TIMEOUT,
        }
    }

    /// Client for a host using the default runtime port.
    pub fn for_host(host: &str) -> Self {
        Self::new(format!("{host}:{RUNTIME_PORT}"))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one command: connect, send, read response lines until EOF.
    /// Blank lines and `#` comments are stripped.
    pub async fn exec(&self, command: &str) -> HaproxyResult<Vec<String>> {
        let io = async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            stream.write_all(command.as_bytes()).await?;
            stream.write_all(b"\n").await?;

            let mut lines = Vec::new();
            let mut reader = BufReader::new(stream).lines();
            while let Some(line) = reader.next_line().await? {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                lines.push(trimmed.to_string());
            }
            Ok(lines)
        };

        debug!(addr = %self.addr, command, "haproxy exec");
        tokio::time::timeout(self.timeout, io)
            .await
            .map_err(|_| HaproxyError::Timeout(self.timeout))?
    }

    /// Read the slot table for the `nodes` backend.
    pub async fn slots(&self) -> HaproxyResult<SlotTable> {
        let lines = self.exec(&format!("show servers state {BACKEND}")).await?;
        let slots = parse_server_state(&lines)?;
        Ok(SlotTable::from_slots(slots))
    }

    /// Addresses currently serving in the backend.
    pub async fn members(&self) -> HaproxyResult<BTreeSet<String>> {
        Ok(self.slots().await?.members())
    }

    /// Bind `addr` to a free slot and enable it. The table is mutated
    /// in place so subsequent adds within the same reconcile see the
    /// slot as taken.
    pub async fn add_member(&self, table: &mut SlotTable, addr: &str) -> HaproxyResult<String> {
        let slot = table.take_free().ok_or_else(|| HaproxyError::NoFreeSlot {
            backend: BACKEND.to_string(),
        })?;

        if let Err(e) = self
            .exec(&format!("set server {BACKEND}/{slot} addr {addr}"))
            .await
        {
            table.return_free(slot);
            return Err(e);
        }
        if let Err(e) = self
            .exec(&format!("set server {BACKEND}/{slot} state ready"))
            .await
        {
            table.return_free(slot);
            return Err(e);
        }

        table.bind(addr, slot.clone());
        debug!(%addr, %slot, "backend member added");
        Ok(slot)
    }

    /// Put every slot bound to `addr` into maintenance, freeing them.
    /// Returns the released slot names.
    pub async fn remove_member(
        &self,
        table: &mut SlotTable,
        addr: &str,
    ) -> HaproxyResult<Vec<String>> {
        let slots = table.slots_for(addr).to_vec();
        let mut released = Vec::with_capacity(slots.len());

        for slot in slots {
            self.exec(&format!("set server {BACKEND}/{slot} state maint"))
                .await?;
            table.release(addr, &slot);
            released.push(slot);
        }

        debug!(%addr, slots = released.len(), "backend member removed");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Fake runtime socket: records each command, replies from a fixed
    /// script keyed by command prefix, then closes the connection.
    async fn fake_haproxy(
        responses: Vec<(&'static str, &'static str)>,
    ) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_writer = seen.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                let Ok(Some(command)) = lines.next_line().await else {
                    continue;
                };
                seen_writer.lock().unwrap().push(command.clone());

                let body = responses
                    .iter()
                    .find(|(prefix, _)| command.starts_with(prefix))
                    .map(|(_, body)| *body)
                    .unwrap_or("\n");
                let _ = write.write_all(body.as_bytes()).await;
                // Connection closes when `write` drops.
            }
        });

        (addr, seen)
    }

    const STATE_DUMP: &str = "1\n\
        # be_id be_name srv_id srv_name srv_addr srv_op_state srv_admin_state srv_uweight srv_iweight srv_time_since_last_change srv_check_status srv_check_result srv_check_health srv_check_state srv_agent_state bk_f_forced_id srv_f_forced_id srv_fqdn srv_port\n\
        3 nodes 1 member1 10.0.0.5 2 4 1 1 5 15 3 4 6 0 0 0 - 80\n\
        3 nodes 2 member2 127.0.0.1 0 5 1 1 5 1 0 0 14 0 0 0 - 80\n\
        3 nodes 3 member3 127.0.0.1 0 5 1 1 5 1 0 0 14 0 0 0 - 80\n";

    #[tokio::test]
    async fn exec_strips_blanks_and_comments() {
        let (addr, _) = fake_haproxy(vec![("show servers state", STATE_DUMP)]).await;
        let client = RuntimeClient::new(addr);

        let lines = client.exec("show servers state nodes").await.unwrap();
        assert_eq!(lines.len(), 4); // version + 3 servers, header comment gone
        assert_eq!(lines[0], "1");
    }

    #[tokio::test]
    async fn slots_projects_members_and_free_pool() {
        let (addr, _) = fake_haproxy(vec![("show servers state", STATE_DUMP)]).await;
        let client = RuntimeClient::new(addr);

        let table = client.slots().await.unwrap();
        assert_eq!(table.members(), BTreeSet::from(["10.0.0.5".to_string()]));
        assert_eq!(table.free_count(), 2);
    }

    #[tokio::test]
    async fn add_member_sets_addr_then_ready() {
        let (addr, seen) = fake_haproxy(vec![
            ("show servers state", STATE_DUMP),
            ("set server", "\n"),
        ])
        .await;
        let client = RuntimeClient::new(addr);

        let mut table = client.slots().await.unwrap();
        let slot = client.add_member(&mut table, "10.0.0.7").await.unwrap();

        let commands = seen.lock().unwrap().clone();
        assert_eq!(
            commands[1],
            format!("set server nodes/{slot} addr 10.0.0.7")
        );
        assert_eq!(commands[2], format!("set server nodes/{slot} state ready"));
        assert!(table.members().contains("10.0.0.7"));
        assert_eq!(table.free_count(), 1);
    }

    #[tokio::test]
    async fn add_member_exhaustion_raises_no_free_slot() {
        let (addr, _) = fake_haproxy(vec![
            ("show servers state", STATE_DUMP),
            ("set server", "\n"),
        ])
        .await;
        let client = RuntimeClient::new(addr);

        let mut table = client.slots().await.unwrap();
        client.add_member(&mut table, "10.0.0.7").await.unwrap();
        client.add_member(&mut table, "10.0.0.8").await.unwrap();

        let err = client.add_member(&mut table, "10.0.0.9").await.unwrap_err();
        assert!(matches!(err, HaproxyError::NoFreeSlot { .. }));
        // The two successful adds are untouched.
        assert_eq!(table.members().len(), 3);
    }

    #[tokio::test]
    async fn remove_member_maints_every_bound_slot() {
        let (addr, seen) = fake_haproxy(vec![
            ("show servers state", STATE_DUMP),
            ("set server", "\n"),
        ])
        .await;
        let client = RuntimeClient::new(addr);

        let mut table = client.slots().await.unwrap();
        let released = client.remove_member(&mut table, "10.0.0.5").await.unwrap();

        assert_eq!(released, ["member1"]);
        assert!(table.members().is_empty());
        assert_eq!(table.free_count(), 3);

        let commands = seen.lock().unwrap().clone();
        assert_eq!(commands[1], "set server nodes/member1 state maint");
    }

    #[tokio::test]
    async fn removed_slot_is_reusable_within_the_same_reconcile() {
        let (addr, _) = fake_haproxy(vec![
            ("show servers state", STATE_DUMP),
            ("set server", "\n"),
        ])
        .await;
        let client = RuntimeClient::new(addr);

        let mut table = client.slots().await.unwrap();
        client.add_member(&mut table, "10.0.0.7").await.unwrap();
        client.add_member(&mut table, "10.0.0.8").await.unwrap();
        client.remove_member(&mut table, "10.0.0.5").await.unwrap();

        // member1 just went back to the pool; the next add may use it.
        let slot = client.add_member(&mut table, "10.0.0.9").await.unwrap();
        assert_eq!(slot, "member1");
    }

    #[tokio::test]
    async fn unreachable_socket_is_io_error() {
        let client =
            RuntimeClient::new("127.0.0.1:1").with_timeout(Duration::from_millis(200));
        let err = client.exec("show info").await.unwrap_err();
        assert!(matches!(err, HaproxyError::Io(_)));
    }
}
