//! 帧读取与命令写出
//!
//! ```text
//! +----------------+----------------+------------------+
//! | Size (4B BE)   | Type (4B BE)   | Payload (Size-4) |
//! +----------------+----------------+------------------+
//! ```
//!
//! `FrameReader` 保存的是已经解压的字节。协商压缩时调用 [`FrameReader::upgrade`]，
//! 缓冲中尚未消费的字节会重新送入新的解码器，一个字节都不丢。

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::compression::{ReaderKind, StreamDecoder, StreamEncoder};
use crate::error::{Error, Result};
use crate::protocol::{Command, Frame, FrameType, ProtocolError, DEFAULT_MAX_FRAME_SIZE};

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// 从字节流中读取NSQ帧
pub struct FrameReader<R> {
    io: R,
    decoder: StreamDecoder,
    buf: BytesMut,
    scratch: Vec<u8>,
    max_frame_size: usize,
}

impl<R> FrameReader<R> {
    pub fn new(io: R) -> Self {
        Self::from_parts(io, StreamDecoder::Passthrough, BytesMut::new())
    }

    pub fn from_parts(io: R, decoder: StreamDecoder, buf: BytesMut) -> Self {
        Self {
            io,
            decoder,
            buf,
            scratch: vec![0u8; READ_CHUNK_SIZE],
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// 当前生效的读取器类型
    pub fn kind(&self) -> ReaderKind {
        self.decoder.kind()
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.io
    }

    /// 已解码但还未消费的字节数
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// 拆出底层流、解码器和缓冲，用于替换字节源
    pub fn into_parts(self) -> (R, StreamDecoder, BytesMut) {
        (self.io, self.decoder, self.buf)
    }

    /// 替换解码器，未消费的字节按新解码器重新解码
    pub fn upgrade(&mut self, decoder: StreamDecoder) -> Result<()> {
        let pending = self.buf.split();
        debug!(
            "切换读取器 {:?} -> {:?}，转交 {} 字节",
            self.decoder.kind(),
            decoder.kind(),
            pending.len()
        );
        self.decoder = decoder;
        self.decoder.decode(&pending, &mut self.buf)?;
        Ok(())
    }

    /// 尝试从缓冲中解析一个完整的帧
    fn try_parse(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let size = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if size < 4 || size as usize > self.max_frame_size {
            return Err(Error::Protocol(ProtocolError::InvalidFrameSize(size)));
        }

        let total = 4 + size as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(4);
        let frame_type = FrameType::try_from(self.buf.get_i32())?;
        let payload = self.buf.split_to(size as usize - 4).freeze();

        Ok(Some(Frame::decode(frame_type, payload)?))
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// 读取下一个NSQ帧；流在任何位置结束都返回 `ConnectionClosed`
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.try_parse()? {
                return Ok(frame);
            }

            let n = self.io.read(&mut self.scratch).await?;
            if n == 0 {
                if !self.buf.is_empty() {
                    debug!("连接在帧中间结束，丢弃 {} 字节", self.buf.len());
                }
                return Err(Error::ConnectionClosed);
            }
            self.decoder.decode(&self.scratch[..n], &mut self.buf)?;
        }
    }
}

impl FrameReader<crate::transport::Transport> {
    /// 取出尚未消费的字节，仅在直通模式下使用(TLS升级前)
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

/// 把命令编码后写入底层流
pub struct CommandWriter<W> {
    io: W,
    encoder: StreamEncoder,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> CommandWriter<W> {
    pub fn new(io: W, encoder: StreamEncoder, write_timeout: Duration) -> Self {
        Self {
            io,
            encoder,
            write_timeout,
        }
    }

    pub async fn write_command(&mut self, command: &Command) -> Result<()> {
        let bytes = command.to_bytes()?;
        self.write_all(&bytes).await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let wire = self.encoder.encode(data)?;
        let io = &mut self.io;
        timeout(self.write_timeout, async move {
            io.write_all(&wire).await?;
            io.flush().await
        })
        .await??;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await.map_err(Error::from)
    }
}
