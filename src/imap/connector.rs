use super::parser::{MessageContext, parse_message};
use crate::config::ImapConfig;
use crate::models::MailAccount;
use crate::supervisor::{SessionConnector, SessionSink};
use async_trait::async_trait;
use chrono::Utc;
use imap::extensions::idle::SetReadTimeout;
use imap::types::Flag;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FETCH_CHUNK: usize = 50;
const FETCH_ITEMS: &str = "(UID FLAGS RFC822)";
/// Time a cancelled session gets to log out before its socket is closed.
const LOGOUT_GRACE: Duration = Duration::from_secs(1);

/// How a session ended, as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The server closed the connection.
    Ended(String),
    /// The socket stalled.
    TimedOut(String),
    /// Protocol, authentication or network failure.
    Failed(String),
}

impl From<imap::error::Error> for SessionOutcome {
    fn from(err: imap::error::Error) -> Self {
        match err {
            imap::error::Error::ConnectionLost => {
                SessionOutcome::Ended("connection closed by server".to_string())
            }
            imap::error::Error::Io(io_err) => io_outcome(io_err),
            other => SessionOutcome::Failed(other.to_string()),
        }
    }
}

fn io_outcome(err: io::Error) -> SessionOutcome {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            SessionOutcome::TimedOut(err.to_string())
        }
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => SessionOutcome::Ended(err.to_string()),
        _ => SessionOutcome::Failed(err.to_string()),
    }
}

/// Shared handle on the session's TCP socket.
///
/// The blocking side attaches a clone right after connecting. Socket options
/// live on the socket itself, so the clone can restore timeouts the `imap`
/// crate clears and can shut the connection down from the async side.
#[derive(Debug, Clone, Default)]
struct SocketControl(Arc<Mutex<Option<TcpStream>>>);

impl SocketControl {
    fn attach(&self, stream: &TcpStream) -> io::Result<()> {
        *self.0.lock() = Some(stream.try_clone()?);
        Ok(())
    }

    fn restore_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        match self.0.lock().as_ref() {
            Some(stream) => stream.set_read_timeout(Some(timeout)),
            None => Ok(()),
        }
    }

    fn close(&self) {
        if let Some(stream) = self.0.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// [`SessionConnector`] speaking IMAP with IDLE.
///
/// The `imap` client is blocking, so each session runs on the blocking pool.
/// Every command outside IDLE is bounded by the socket timeout. Once the token
/// fires the session gets a short grace period to log out, then its socket is
/// shut down underneath it.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionConnector for ImapConnector {
    async fn run(&self, account: Arc<MailAccount>, sink: SessionSink, shutdown: CancellationToken) {
        let config = self.config.clone();
        let control = SocketControl::default();
        let session_sink = sink.clone();
        let session_cancel = shutdown.clone();
        let session_control = control.clone();

        let mut task = tokio::task::spawn_blocking(move || {
            run_session(&account, &config, &session_sink, &session_cancel, &session_control)
        });

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                if tokio::time::timeout(LOGOUT_GRACE, &mut task).await.is_err() {
                    debug!("{}: closing socket of cancelled session", sink.account_id());
                }
                control.close();
                return;
            }
            result = &mut task => result,
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(SessionOutcome::Ended(reason))) => {
                info!("{}: IMAP session ended: {}", sink.account_id(), reason);
                sink.end();
            }
            Ok(Err(SessionOutcome::TimedOut(reason))) => {
                warn!("{}: IMAP session timed out: {}", sink.account_id(), reason);
                sink.timeout();
            }
            Ok(Err(SessionOutcome::Failed(reason))) => sink.error(reason),
            Err(join_err) => sink.error(format!("IMAP session task failed: {join_err}")),
        }
    }
}

/// Connect to the first address that accepts within `timeout` and bound
/// every later read and write by the same limit.
fn open_socket(account: &MailAccount, timeout: Duration) -> Result<TcpStream, SessionOutcome> {
    let addresses = (account.host.as_str(), account.port)
        .to_socket_addrs()
        .map_err(io_outcome)?;

    let mut last_error = None;
    for address in addresses {
        match TcpStream::connect_timeout(&address, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout)).map_err(io_outcome)?;
                stream.set_write_timeout(Some(timeout)).map_err(io_outcome)?;
                return Ok(stream);
            }
            Err(err) => {
                debug!("{}: connect to {} failed: {}", account.id, address, err);
                last_error = Some(err);
            }
        }
    }

    Err(match last_error {
        Some(err) => io_outcome(err),
        None => SessionOutcome::Failed(format!("{} resolved to no address", account.host)),
    })
}

fn run_session(
    account: &MailAccount,
    config: &ImapConfig,
    sink: &SessionSink,
    cancel: &CancellationToken,
    control: &SocketControl,
) -> Result<(), SessionOutcome> {
    let tcp = open_socket(account, config.socket_timeout)?;
    control.attach(&tcp).map_err(io_outcome)?;
    if cancel.is_cancelled() {
        return Ok(());
    }

    if account.tls {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|err| SessionOutcome::Failed(format!("TLS setup failed: {err}")))?;
        let stream = tls.connect(&account.host, tcp).map_err(|err| {
            SessionOutcome::Failed(format!("TLS handshake with {} failed: {err}", account.host))
        })?;
        let mut client = imap::Client::new(stream);
        client.read_greeting()?;
        let session = client
            .login(&account.user, &account.password)
            .map_err(|(err, _)| err)?;
        drive(session, account, config, sink, cancel, control)
    } else {
        let mut client = imap::Client::new(tcp);
        client.read_greeting()?;
        let session = client
            .login(&account.user, &account.password)
            .map_err(|(err, _)| err)?;
        drive(session, account, config, sink, cancel, control)
    }
}

fn drive<T>(
    mut session: imap::Session<T>,
    account: &MailAccount,
    config: &ImapConfig,
    sink: &SessionSink,
    cancel: &CancellationToken,
    control: &SocketControl,
) -> Result<(), SessionOutcome>
where
    T: Read + Write + SetReadTimeout,
{
    let mailbox = session.select(&config.folder)?;
    debug!(
        "{}: selected {} ({} messages)",
        account.id, config.folder, mailbox.exists
    );
    sink.ready();

    let since = (Utc::now() - chrono::Duration::days(config.sync_days)).format("%d-%b-%Y");
    let mut backlog: Vec<u32> = session
        .uid_search(format!("SINCE {since}"))?
        .into_iter()
        .collect();
    backlog.sort_unstable();
    info!(
        "{}: back-filling {} messages since {}",
        account.id,
        backlog.len(),
        since
    );

    let mut last_uid = mailbox
        .uid_next
        .map(|next| next.saturating_sub(1))
        .unwrap_or(0);
    if let Some(&max) = backlog.last() {
        last_uid = last_uid.max(max);
    }
    let mut consuming = deliver(&mut session, &backlog, account, config, sink, cancel)?;

    while consuming && !cancel.is_cancelled() {
        let waited = session.idle()?.wait_with_timeout(config.idle_timeout).map(|_| ());
        // The idle wait leaves the socket without a read timeout.
        control
            .restore_read_timeout(config.socket_timeout)
            .map_err(io_outcome)?;
        waited?;
        if cancel.is_cancelled() {
            break;
        }

        let mut fresh: Vec<u32> = session
            .uid_search(format!("UID {}:*", last_uid.saturating_add(1)))?
            .into_iter()
            .filter(|uid| *uid > last_uid)
            .collect();
        fresh.sort_unstable();

        if let Some(&max) = fresh.last() {
            debug!("{}: {} new messages", account.id, fresh.len());
            last_uid = max;
            consuming = deliver(&mut session, &fresh, account, config, sink, cancel)?;
        }
    }

    debug!("{}: logging out", account.id);
    let _ = session.logout();
    Ok(())
}

/// Fetch and hand over `uids`. Returns `false` once the session is cancelled
/// or nobody consumes documents.
fn deliver<T: Read + Write>(
    session: &mut imap::Session<T>,
    uids: &[u32],
    account: &MailAccount,
    config: &ImapConfig,
    sink: &SessionSink,
    cancel: &CancellationToken,
) -> Result<bool, SessionOutcome> {
    for chunk in uids.chunks(FETCH_CHUNK) {
        if cancel.is_cancelled() {
            debug!("{}: cancelled with messages left to fetch", account.id);
            return Ok(false);
        }
        let set = chunk
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let fetches = session.uid_fetch(&set, FETCH_ITEMS)?;

        for fetch in fetches.iter() {
            let Some(raw) = fetch.body() else {
                continue;
            };
            let context = MessageContext {
                account_id: account.id.clone(),
                folder: config.folder.clone(),
                uid: fetch.uid.unwrap_or(0),
                flags: fetch.flags().iter().map(flag_name).collect(),
            };

            match parse_message(raw, &context) {
                Ok(document) => {
                    if !sink.deliver(document) {
                        return Ok(false);
                    }
                }
                Err(err) => warn!(
                    "{}: dropping unparseable message uid {}: {}",
                    account.id, context.uid, err
                ),
            }
        }
    }

    Ok(true)
}

fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
        #[allow(unreachable_patterns)]
        other => format!("{other:?}"),
    }
}
