//! In-process SSH server for tests
//!
//! Accepts one user/password pair and serves `direct-tcpip` channels by
//! dialing the requested target from the test process itself. Session
//! channels can run a read-only `sftp` subsystem over an in-memory tree.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::ssh_key::private::{Ed25519Keypair, KeypairData};
use russh::keys::PrivateKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId};
use russh_sftp::protocol::{
    Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::config::{AuthMethod, SshConfig};

pub(crate) const TEST_USER: &str = "operator";
pub(crate) const TEST_PASSWORD: &str = "1q2w#E$R";

pub(crate) struct TestSshServer {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestSshServer {
    /// Client configuration pointing at this server
    pub fn client_config(&self, password: &str) -> SshConfig {
        SshConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            username: TEST_USER.to_string(),
            auth: AuthMethod::password(password),
            timeout_secs: 5,
            ..Default::default()
        }
    }
}

impl Drop for TestSshServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// File served by the test SFTP subsystem
#[derive(Debug, Clone)]
pub(crate) struct RemoteFile {
    pub data: Vec<u8>,
    /// Seconds since the Unix epoch
    pub mtime: u32,
}

type RemoteTree = Arc<BTreeMap<String, RemoteFile>>;

struct GatewayHandler {
    files: RemoteTree,
    sessions: HashMap<ChannelId, Channel<Msg>>,
}

impl server::Handler for GatewayHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == TEST_USER && password == TEST_PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let target = format!("{}:{}", host_to_connect, port_to_connect);
        tokio::spawn(async move {
            if let Ok(mut upstream) = TcpStream::connect(&target).await {
                let mut stream = channel.into_stream();
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
            }
        });
        Ok(true)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.sessions.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match (name, self.sessions.remove(&channel)) {
            ("sftp", Some(open)) => {
                let _ = session.channel_success(channel);
                let handler = SftpFiles::new(self.files.clone());
                tokio::spawn(russh_sftp::server::run(open.into_stream(), handler));
            }
            _ => {
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }
}

/// Read-only SFTP view of a [`RemoteTree`]
struct SftpFiles {
    files: RemoteTree,
    /// Open handle -> path
    handles: HashMap<String, String>,
    listed: HashSet<String>,
    next_handle: u32,
}

impl SftpFiles {
    fn new(files: RemoteTree) -> Self {
        Self {
            files,
            handles: HashMap::new(),
            listed: HashSet::new(),
            next_handle: 0,
        }
    }

    fn handle(&mut self, id: u32, path: String) -> Handle {
        self.next_handle += 1;
        let handle = format!("h{}", self.next_handle);
        self.handles.insert(handle.clone(), path);
        Handle { id, handle }
    }

    fn children(&self, dir: &str) -> Vec<File> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files
            .iter()
            .filter_map(|(path, file)| {
                let name = path.strip_prefix(&prefix)?;
                (!name.contains('/')).then(|| {
                    File::new(
                        name,
                        FileAttributes {
                            size: Some(file.data.len() as u64),
                            mtime: Some(file.mtime),
                            ..Default::default()
                        },
                    )
                })
            })
            .collect()
    }
}

impl russh_sftp::server::Handler for SftpFiles {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        _version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        _pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        if !self.files.contains_key(&filename) {
            return Err(StatusCode::NoSuchFile);
        }
        Ok(self.handle(id, filename))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let path = self.handles.get(&handle).ok_or(StatusCode::Failure)?;
        let file = self.files.get(path).ok_or(StatusCode::NoSuchFile)?;
        let start = usize::try_from(offset).map_err(|_| StatusCode::Eof)?;
        if start >= file.data.len() {
            return Err(StatusCode::Eof);
        }
        let end = file.data.len().min(start + len as usize);
        Ok(Data {
            id,
            data: file.data[start..end].to_vec(),
        })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.handles.remove(&handle);
        self.listed.remove(&handle);
        Ok(Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        })
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        if self.children(&path).is_empty() {
            return Err(StatusCode::NoSuchFile);
        }
        Ok(self.handle(id, path))
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let path = self.handles.get(&handle).ok_or(StatusCode::Failure)?.clone();
        if !self.listed.insert(handle) {
            return Err(StatusCode::Eof);
        }
        Ok(Name {
            id,
            files: self.children(&path),
        })
    }
}

pub(crate) fn host_key() -> PrivateKey {
    let keypair = Ed25519Keypair::from_seed(&[7u8; 32]);
    PrivateKey::new(KeypairData::Ed25519(keypair), "mailtunnel-test")
        .expect("valid ed25519 test key")
}

/// Start a server on an ephemeral loopback port
pub(crate) async fn spawn_test_server() -> TestSshServer {
    spawn_sftp_server(Vec::new()).await
}

/// Like [`spawn_test_server`], with `files` (absolute path, contents)
/// available over SFTP
pub(crate) async fn spawn_sftp_server(files: Vec<(String, RemoteFile)>) -> TestSshServer {
    let files: RemoteTree = Arc::new(files.into_iter().collect());
    let config = Arc::new(server::Config {
        keys: vec![host_key()],
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
    let addr = listener.local_addr().expect("test server address");
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((socket, _)) = accepted else { continue };
                    let config = config.clone();
                    let handler = GatewayHandler {
                        files: files.clone(),
                        sessions: HashMap::new(),
                    };
                    tokio::spawn(async move {
                        if let Ok(session) = server::run_stream(config, socket, handler).await {
                            let _ = session.await;
                        }
                    });
                }
            }
        }
    });

    TestSshServer { addr, shutdown }
}

/// Echo every byte back until the peer closes
pub(crate) async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo server");
    let addr = listener.local_addr().expect("echo server address");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}
