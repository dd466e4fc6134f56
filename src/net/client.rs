//! A minimal asynchronous client Sentinel uses to talk to the instances and
//! peer Sentinels it monitors — PING, INFO, PUBLISH/SUBSCRIBE, and the
//! handful of admin commands the failover driver issues. Grounded on
//! `spineldb::core::warden::client::WardenClient`, extended with AUTH,
//! CLIENT SETNAME/KILL, SUBSCRIBE, and the failover-driver commands
//! `spec.md` §4.1/§4.6 require.

use crate::error::SentinelError;
use crate::protocol::{RespFrame, RespFrameCodec};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct SentinelClient {
    stream: TcpStream,
    codec: RespFrameCodec,
    read_buf: BytesMut,
}

impl SentinelClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, SentinelError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| SentinelError::Timeout)??;
        Ok(Self {
            stream,
            codec: RespFrameCodec,
            read_buf: BytesMut::with_capacity(4096),
        })
    }

    pub async fn send_and_receive(&mut self, frame: RespFrame) -> Result<RespFrame, SentinelError> {
        let mut write_buf = BytesMut::new();
        self.codec.encode(frame, &mut write_buf)?;
        self.stream.write_all(&write_buf).await?;
        self.next_frame().await
    }

    async fn next_frame(&mut self) -> Result<RespFrame, SentinelError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                return Ok(frame);
            }
            let read_fut = self.stream.read_buf(&mut self.read_buf);
            match tokio::time::timeout(READ_TIMEOUT, read_fut).await {
                Ok(Ok(0)) => {
                    return Err(SentinelError::Protocol("connection closed by peer".into()));
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(SentinelError::Timeout),
            }
        }
    }

    /// Sends PING and reports whether the reply counts as "available" per
    /// `spec.md` §4.2's PING-reply policy: `PONG`/`LOADING`/`MASTERDOWN` are
    /// available; any other well-formed reply still proves the link alive
    /// (`Ok(false)`) but not the instance available.
    pub async fn ping(&mut self) -> Result<bool, SentinelError> {
        let reply = self
            .send_and_receive(RespFrame::array_of_bulks(["PING"]))
            .await?;
        let available = match &reply {
            RespFrame::SimpleString(s) => {
                s.eq_ignore_ascii_case("PONG") || s.eq_ignore_ascii_case("LOADING") || s.eq_ignore_ascii_case("MASTERDOWN")
            }
            RespFrame::Error(e) => e.starts_with("LOADING") || e.starts_with("MASTERDOWN"),
            _ => false,
        };
        Ok(available)
    }

    pub async fn auth(&mut self, user: &str, pass: &str) -> Result<(), SentinelError> {
        let frame = if user.is_empty() {
            RespFrame::array_of_bulks(["AUTH", pass])
        } else {
            RespFrame::array_of_bulks(["AUTH", user, pass])
        };
        self.send_and_receive(frame).await?;
        Ok(())
    }

    pub async fn set_name(&mut self, name: &str) -> Result<(), SentinelError> {
        self.send_and_receive(RespFrame::array_of_bulks(["CLIENT", "SETNAME", name]))
            .await?;
        Ok(())
    }

    pub async fn subscribe(&mut self, channel: &str) -> Result<(), SentinelError> {
        self.send_and_receive(RespFrame::array_of_bulks(["SUBSCRIBE", channel]))
            .await?;
        Ok(())
    }

    pub async fn publish(&mut self, channel: &str, message: &str) -> Result<(), SentinelError> {
        self.send_and_receive(RespFrame::array_of_bulks(["PUBLISH", channel, message]))
            .await?;
        Ok(())
    }

    /// Reads the next pub/sub push message, returning `(channel, payload)`.
    pub async fn read_message(&mut self) -> Result<(String, bytes::Bytes), SentinelError> {
        loop {
            let frame = self.next_frame().await?;
            if let RespFrame::Array(parts) = frame
                && parts.len() == 3
                && let (Some(kind), Some(channel), RespFrame::BulkString(payload)) =
                    (parts[0].as_str_lossy(), parts[1].as_str_lossy(), &parts[2])
                && kind.eq_ignore_ascii_case("message")
            {
                return Ok((channel.into_owned(), payload.clone()));
            }
        }
    }

    pub async fn info(&mut self, section: &str) -> Result<String, SentinelError> {
        let reply = self
            .send_and_receive(RespFrame::array_of_bulks(["INFO", section]))
            .await?;
        match reply {
            RespFrame::BulkString(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
            other => Err(SentinelError::Protocol(format!("unexpected INFO reply: {other:?}"))),
        }
    }

    pub async fn replicaof(&mut self, host: &str, port: &str) -> Result<(), SentinelError> {
        self.send_and_receive(RespFrame::array_of_bulks(["REPLICAOF", host, port]))
            .await?;
        Ok(())
    }

    pub async fn replicaof_no_one(&mut self) -> Result<(), SentinelError> {
        self.send_and_receive(RespFrame::array_of_bulks(["REPLICAOF", "NO", "ONE"]))
            .await?;
        Ok(())
    }

    pub async fn config_rewrite(&mut self) -> Result<(), SentinelError> {
        self.send_and_receive(RespFrame::array_of_bulks(["CONFIG", "REWRITE"]))
            .await?;
        Ok(())
    }

    pub async fn client_kill_type(&mut self, kind: &str) -> Result<(), SentinelError> {
        self.send_and_receive(RespFrame::array_of_bulks(["CLIENT", "KILL", "TYPE", kind]))
            .await?;
        Ok(())
    }
}
