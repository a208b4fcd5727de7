//! Minimal async IMAP client
//!
//! Covers only what warmup needs: LOGIN, SELECT, UID SEARCH, UID FETCH of
//! headers, UID STORE of `\Seen`, UID MOVE (with a COPY fallback) and
//! LOGOUT. Literals in responses are read as raw bytes.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use kindling_common::{Error, Result};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::vault::{Security, ServerSettings};

const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Plaintext or TLS connection
pub enum ImapStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

fn tls_connector() -> TlsConnector {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn upgrade(tcp: TcpStream, host: &str) -> Result<ImapStream> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Validation(format!("Invalid IMAP host {}: {}", host, e)))?;
    let tls = tls_connector()
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Transient(format!("IMAP TLS handshake failed: {}", e)))?;
    Ok(ImapStream::Tls(Box::new(tls)))
}

fn io_err(e: io::Error) -> Error {
    Error::Transient(format!("IMAP I/O error: {}", e))
}

/// One untagged response line with any literals it carried
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseLine {
    pub text: String,
    pub literals: Vec<Vec<u8>>,
}

/// IMAP session over any byte stream
pub struct ImapClient<S = ImapStream> {
    stream: BufReader<S>,
    next_tag: u32,
    capabilities: Vec<String>,
}

impl ImapClient<ImapStream> {
    /// Connect and read the greeting, upgrading with STARTTLS when configured
    pub async fn connect(settings: &ServerSettings) -> Result<Self> {
        let addr = format!("{}:{}", settings.host, settings.port);
        let tcp = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Transient(format!("IMAP connect to {} timed out", addr)))?
            .map_err(|e| Error::Transient(format!("IMAP connect to {} failed: {}", addr, e)))?;

        match settings.security {
            Security::Tls => Self::from_stream(upgrade(tcp, &settings.host).await?).await,
            Security::None => Self::from_stream(ImapStream::Plain(tcp)).await,
            Security::StartTls => {
                let mut plain = Self::from_stream(ImapStream::Plain(tcp)).await?;
                plain.command("STARTTLS").await?;
                let ImapStream::Plain(tcp) = plain.stream.into_inner() else {
                    return Err(Error::Internal("IMAP stream already encrypted".to_string()));
                };
                Ok(Self {
                    stream: BufReader::new(upgrade(tcp, &settings.host).await?),
                    next_tag: plain.next_tag,
                    capabilities: Vec::new(),
                })
            }
        }
    }
}

impl<S> ImapClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an open stream and consume the server greeting
    pub async fn from_stream(stream: S) -> Result<Self> {
        let mut client = Self {
            stream: BufReader::new(stream),
            next_tag: 1,
            capabilities: Vec::new(),
        };
        let greeting = client.read_line().await?;
        if greeting.text.starts_with("* BYE") {
            return Err(Error::Transient(format!("IMAP server refused: {}", greeting.text)));
        }
        Ok(client)
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let command = format!("LOGIN {} {}", quote(username), quote(password));
        match self.command(&command).await {
            Err(Error::Transport(message)) => Err(Error::Auth(format!(
                "IMAP login rejected: {}",
                message
            ))),
            other => other.map(|_| ()),
        }?;

        let lines = self.command("CAPABILITY").await?;
        self.capabilities = lines
            .iter()
            .filter_map(|l| l.text.strip_prefix("* CAPABILITY "))
            .flat_map(|caps| caps.split_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        Ok(())
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub async fn select(&mut self, folder: &str) -> Result<()> {
        self.command(&format!("SELECT {}", quote(folder))).await?;
        Ok(())
    }

    pub async fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>> {
        let lines = self.command(&format!("UID SEARCH {}", criteria)).await?;
        Ok(parse_search(&lines))
    }

    /// Raw header block for each UID
    pub async fn uid_fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<(u32, Vec<u8>)>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uid_set(uids);
        let lines = self
            .command(&format!("UID FETCH {} (UID BODY.PEEK[HEADER])", set))
            .await?;
        Ok(parse_fetch_headers(&lines))
    }

    pub async fn uid_mark_seen(&mut self, uid: u32) -> Result<()> {
        self.command(&format!("UID STORE {} +FLAGS.SILENT (\\Seen)", uid))
            .await?;
        Ok(())
    }

    /// Move messages, falling back to COPY + delete + expunge without MOVE
    pub async fn uid_move(&mut self, uids: &[u32], folder: &str) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let set = uid_set(uids);
        if self.has_capability("MOVE") {
            self.command(&format!("UID MOVE {} {}", set, quote(folder)))
                .await?;
            return Ok(());
        }

        self.command(&format!("UID COPY {} {}", set, quote(folder)))
            .await?;
        self.command(&format!("UID STORE {} +FLAGS.SILENT (\\Deleted)", set))
            .await?;
        if self.has_capability("UIDPLUS") {
            self.command(&format!("UID EXPUNGE {}", set)).await?;
        } else {
            self.command("EXPUNGE").await?;
        }
        Ok(())
    }

    pub async fn logout(mut self) -> Result<()> {
        // Some servers close the socket before the tagged OK
        let _ = self.command("LOGOUT").await;
        Ok(())
    }

    /// Send a tagged command and collect untagged lines until its completion
    pub async fn command(&mut self, command: &str) -> Result<Vec<ResponseLine>> {
        let tag = format!("K{:04}", self.next_tag);
        self.next_tag += 1;

        let verb = command.split_whitespace().next().unwrap_or_default();
        debug!(tag = %tag, verb = %verb, "IMAP command");

        let line = format!("{} {}\r\n", tag, command);
        tokio::time::timeout(IO_TIMEOUT, async {
            self.stream.get_mut().write_all(line.as_bytes()).await?;
            self.stream.get_mut().flush().await
        })
        .await
        .map_err(|_| Error::Transient("IMAP write timed out".to_string()))?
        .map_err(io_err)?;

        let mut untagged = Vec::new();
        loop {
            let response = self.read_line().await?;
            let Some(status) = response.text.strip_prefix(&format!("{} ", tag)) else {
                untagged.push(response);
                continue;
            };

            let status = status.trim_end();
            return if status.starts_with("OK") {
                Ok(untagged)
            } else {
                Err(Error::Transport(format!("IMAP {} failed: {}", verb, status)))
            };
        }
    }

    async fn read_line(&mut self) -> Result<ResponseLine> {
        tokio::time::timeout(IO_TIMEOUT, self.read_line_inner())
            .await
            .map_err(|_| Error::Transient("IMAP read timed out".to_string()))?
    }

    async fn read_line_inner(&mut self) -> Result<ResponseLine> {
        let mut response = ResponseLine::default();
        loop {
            let mut raw = Vec::new();
            let n = self
                .stream
                .read_until(b'\n', &mut raw)
                .await
                .map_err(io_err)?;
            if n == 0 {
                return Err(Error::Transient("IMAP connection closed".to_string()));
            }

            let chunk = String::from_utf8_lossy(&raw);
            let chunk = chunk.trim_end_matches(|c| c == '\r' || c == '\n');
            response.text.push_str(chunk);

            match literal_length(chunk) {
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.stream
                        .read_exact(&mut literal)
                        .await
                        .map_err(io_err)?;
                    response.literals.push(literal);
                }
                None => return Ok(response),
            }
        }
    }
}

/// `{123}` at the end of a line announces a literal of that many bytes
fn literal_length(line: &str) -> Option<usize> {
    let open = line.strip_suffix('}')?.rfind('{')?;
    line[open + 1..line.len() - 1].parse().ok()
}

/// Quoted IMAP string
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_search(lines: &[ResponseLine]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter_map(|n| n.parse().ok())
        .collect()
}

fn parse_fetch_headers(lines: &[ResponseLine]) -> Vec<(u32, Vec<u8>)> {
    lines
        .iter()
        .filter(|l| l.text.contains(" FETCH "))
        .filter_map(|l| {
            let uid = fetch_uid(&l.text)?;
            let header = l.literals.first()?.clone();
            Some((uid, header))
        })
        .collect()
}

fn fetch_uid(text: &str) -> Option<u32> {
    let start = text.find("UID ")? + 4;
    text[start..]
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}
