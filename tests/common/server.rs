//! Scripted NNTP server for integration tests

use newsweave::nntp::framing::encode_multiline;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Behaviour of the mock server
#[derive(Default)]
pub struct ServerScript {
    /// Article bodies by message id (without angle brackets)
    pub articles: HashMap<String, Vec<u8>>,
    /// Groups and their `count low high`
    pub groups: HashMap<String, (u64, u64, u64)>,
    /// Message ids that never get an answer
    pub silent: HashSet<String>,
    /// Upper bound of a random delay before each BODY reply
    pub max_delay: Option<Duration>,
}

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
    bodies: Mutex<HashMap<String, usize>>,
}

/// Running mock server; stops when dropped
pub struct MockNntpServer {
    addr: SocketAddr,
    counters: Arc<Counters>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for MockNntpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl MockNntpServer {
    /// Start serving `script` on an ephemeral local port
    pub async fn start(script: ServerScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let script = Arc::new(script);
        let counters = Arc::new(Counters::default());

        let accept_counters = counters.clone();
        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let script = script.clone();
                let counters = accept_counters.clone();
                counters.connections.fetch_add(1, Ordering::SeqCst);
                let open = counters.open.fetch_add(1, Ordering::SeqCst) + 1;
                counters.peak_open.fetch_max(open, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = serve(socket, &script, &counters).await;
                    counters.open.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self { addr, counters, handle }
    }

    /// Port to point the client at
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    /// Most connections open at the same time
    pub fn peak_connections(&self) -> usize {
        self.counters.peak_open.load(Ordering::SeqCst)
    }

    /// How often BODY was requested for `id`
    pub fn body_requests(&self, id: &str) -> usize {
        self.counters.bodies.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

async fn serve(socket: TcpStream, script: &ServerScript, counters: &Counters) -> std::io::Result<()> {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"200 mock server ready\r\n").await?;

    while let Some(line) = lines.next_line().await? {
        let mut parts = line.splitn(2, ' ');
        let verb = parts.next().unwrap_or_default().to_ascii_uppercase();
        let arg = parts.next().unwrap_or_default().trim().to_string();

        match verb.as_str() {
            "QUIT" => {
                write.write_all(b"205 bye\r\n").await?;
                return Ok(());
            }
            "GROUP" => match script.groups.get(&arg) {
                Some((count, low, high)) => {
                    let reply = format!("211 {} {} {} {}\r\n", count, low, high, arg);
                    write.write_all(reply.as_bytes()).await?;
                }
                None => write.write_all(b"411 no such group\r\n").await?,
            },
            "BODY" | "STAT" => {
                let id = arg.trim_start_matches('<').trim_end_matches('>').to_string();
                if verb == "BODY" {
                    *counters.bodies.lock().unwrap().entry(id.clone()).or_insert(0) += 1;
                }
                if script.silent.contains(&id) {
                    continue;
                }
                if let Some(max) = script.max_delay {
                    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                }
                match script.articles.get(&id) {
                    Some(body) if verb == "BODY" => {
                        write.write_all(format!("222 0 <{}>\r\n", id).as_bytes()).await?;
                        write.write_all(&encode_multiline(body)).await?;
                    }
                    Some(_) => {
                        write.write_all(format!("223 0 <{}>\r\n", id).as_bytes()).await?;
                    }
                    None => write.write_all(b"430 no such article\r\n").await?,
                }
            }
            _ => write.write_all(b"500 unknown command\r\n").await?,
        }
    }
    Ok(())
}
