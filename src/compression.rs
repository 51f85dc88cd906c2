//! 流压缩适配层
//!
//! IDENTIFY 协商成功后，连接上的字节流会整体切换为 snappy 帧格式或原始 deflate 流。
//! 解码端按块缓冲，不假设协议帧与压缩块对齐；编码端每次写入都完整刷出。

use std::io::Read;

use bytes::BytesMut;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::protocol::ProtocolError;

/// snappy 帧格式的流标识块
pub const SNAPPY_STREAM_IDENTIFIER: &[u8] = b"\xff\x06\x00\x00sNaPpY";

const SNAPPY_CHUNK_HEADER_SIZE: usize = 4;
const SNAPPY_CHUNK_STREAM_IDENTIFIER: u8 = 0xff;
const SNAPPY_CHUNK_COMPRESSED: u8 = 0x00;
const SNAPPY_CHUNK_UNCOMPRESSED: u8 = 0x01;

const SCRATCH_SIZE: usize = 16 * 1024;

/// 默认 deflate 压缩级别
pub const DEFAULT_DEFLATE_LEVEL: u32 = 6;

/// 当前生效的读取器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    Plain,
    Snappy,
    Deflate,
}

/// 解压端
#[derive(Debug)]
pub enum StreamDecoder {
    Passthrough,
    Snappy(SnappyDecoder),
    Deflate(DeflateDecoder),
}

impl StreamDecoder {
    pub fn snappy() -> Self {
        StreamDecoder::Snappy(SnappyDecoder::new())
    }

    pub fn deflate() -> Self {
        StreamDecoder::Deflate(DeflateDecoder::new())
    }

    pub fn kind(&self) -> ReaderKind {
        match self {
            StreamDecoder::Passthrough => ReaderKind::Plain,
            StreamDecoder::Snappy(_) => ReaderKind::Snappy,
            StreamDecoder::Deflate(_) => ReaderKind::Deflate,
        }
    }

    /// 输入原始字节，把能解出的明文追加到 `out`
    pub fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            StreamDecoder::Passthrough => {
                out.extend_from_slice(input);
                Ok(())
            }
            StreamDecoder::Snappy(decoder) => decoder.decode(input, out),
            StreamDecoder::Deflate(decoder) => decoder.decode(input, out),
        }
    }
}

/// 压缩端
#[derive(Debug)]
pub enum StreamEncoder {
    Passthrough,
    Snappy(SnappyEncoder),
    Deflate(DeflateEncoder),
}

impl StreamEncoder {
    pub fn snappy() -> Self {
        StreamEncoder::Snappy(SnappyEncoder::new())
    }

    pub fn deflate(level: u32) -> Self {
        StreamEncoder::Deflate(DeflateEncoder::new(level))
    }

    pub fn kind(&self) -> ReaderKind {
        match self {
            StreamEncoder::Passthrough => ReaderKind::Plain,
            StreamEncoder::Snappy(_) => ReaderKind::Snappy,
            StreamEncoder::Deflate(_) => ReaderKind::Deflate,
        }
    }

    /// 压缩一次写入的数据，返回可以直接写到底层流的字节
    pub fn encode(&mut self, input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match self {
            StreamEncoder::Passthrough => Ok(input.to_vec()),
            StreamEncoder::Snappy(encoder) => encoder.encode(input),
            StreamEncoder::Deflate(encoder) => encoder.encode(input),
        }
    }
}

/// snappy 帧格式解码，跨块边界缓冲
#[derive(Debug, Default)]
pub struct SnappyDecoder {
    pending: BytesMut,
    seen_identifier: bool,
}

impl SnappyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> Result<(), ProtocolError> {
        self.pending.extend_from_slice(input);

        while self.pending.len() >= SNAPPY_CHUNK_HEADER_SIZE {
            let chunk_type = self.pending[0];
            let len = u32::from_le_bytes([self.pending[1], self.pending[2], self.pending[3], 0])
                as usize;
            if self.pending.len() < SNAPPY_CHUNK_HEADER_SIZE + len {
                break;
            }
            let chunk = self.pending.split_to(SNAPPY_CHUNK_HEADER_SIZE + len);

            match chunk_type {
                SNAPPY_CHUNK_STREAM_IDENTIFIER => {
                    if chunk[..] != *SNAPPY_STREAM_IDENTIFIER {
                        return Err(ProtocolError::Snappy("无效的流标识".to_string()));
                    }
                    self.seen_identifier = true;
                }
                SNAPPY_CHUNK_COMPRESSED | SNAPPY_CHUNK_UNCOMPRESSED => {
                    if !self.seen_identifier {
                        return Err(ProtocolError::Snappy("数据块之前缺少流标识".to_string()));
                    }
                    // 单块重新拼上流标识交给 snap 校验 CRC 并解压
                    let mut framed = Vec::with_capacity(SNAPPY_STREAM_IDENTIFIER.len() + chunk.len());
                    framed.extend_from_slice(SNAPPY_STREAM_IDENTIFIER);
                    framed.extend_from_slice(&chunk);
                    let mut decoded = Vec::new();
                    snap::read::FrameDecoder::new(&framed[..])
                        .read_to_end(&mut decoded)
                        .map_err(|e| ProtocolError::Snappy(e.to_string()))?;
                    out.extend_from_slice(&decoded);
                }
                0x02..=0x7f => {
                    return Err(ProtocolError::Snappy(format!(
                        "不可跳过的保留块类型: {:#04x}",
                        chunk_type
                    )));
                }
                // 填充块和可跳过块
                _ => {}
            }
        }

        Ok(())
    }
}

/// snappy 帧格式编码，流标识只在首次写入时发送
#[derive(Debug, Default)]
pub struct SnappyEncoder {
    started: bool,
}

impl SnappyEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn encode(&mut self, input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut framed = Vec::new();
        snap::read::FrameEncoder::new(input)
            .read_to_end(&mut framed)
            .map_err(|e| ProtocolError::Snappy(e.to_string()))?;

        if self.started && framed.starts_with(SNAPPY_STREAM_IDENTIFIER) {
            framed.drain(..SNAPPY_STREAM_IDENTIFIER.len());
        }
        self.started = true;
        Ok(framed)
    }
}

/// 原始 deflate 解压，状态在整个会话中保持
pub struct DeflateDecoder {
    inner: Decompress,
    scratch: Vec<u8>,
}

impl DeflateDecoder {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(false),
            scratch: vec![0u8; SCRATCH_SIZE],
        }
    }

    fn decode(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<(), ProtocolError> {
        loop {
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            let status = self
                .inner
                .decompress(input, &mut self.scratch, FlushDecompress::None)
                .map_err(|e| ProtocolError::Deflate(e.to_string()))?;
            let consumed = (self.inner.total_in() - before_in) as usize;
            let produced = (self.inner.total_out() - before_out) as usize;

            out.extend_from_slice(&self.scratch[..produced]);
            input = &input[consumed..];

            if status == Status::StreamEnd {
                break;
            }
            if consumed == 0 && produced == 0 {
                break;
            }
            if input.is_empty() && produced < self.scratch.len() {
                break;
            }
        }
        Ok(())
    }
}

impl Default for DeflateDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeflateDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateDecoder")
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

/// 原始 deflate 压缩，每次写入后同步刷出
pub struct DeflateEncoder {
    inner: Compress,
    scratch: Vec<u8>,
}

impl DeflateEncoder {
    pub fn new(level: u32) -> Self {
        Self {
            inner: Compress::new(Compression::new(level.clamp(1, 9)), false),
            scratch: vec![0u8; SCRATCH_SIZE],
        }
    }

    fn encode(&mut self, mut input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        loop {
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            self.inner
                .compress(input, &mut self.scratch, FlushCompress::Sync)
                .map_err(|e| ProtocolError::Deflate(e.to_string()))?;
            let consumed = (self.inner.total_in() - before_in) as usize;
            let produced = (self.inner.total_out() - before_out) as usize;

            out.extend_from_slice(&self.scratch[..produced]);
            input = &input[consumed..];

            if consumed == 0 && produced == 0 {
                break;
            }
            if input.is_empty() && produced < self.scratch.len() {
                break;
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for DeflateEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateEncoder")
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}
