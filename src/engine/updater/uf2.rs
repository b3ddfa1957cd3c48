//! UF2 decoding
//!
//! Flattens a UF2 container into the raw flash image a debug probe programs.
//! Gaps between blocks are filled with 0xFF, the erased-flash value.

use thiserror::Error;

pub const BLOCK_SIZE: usize = 512;
pub const MAGIC_START0: u32 = 0x0A32_4655;
pub const MAGIC_START1: u32 = 0x9E5D_5157;
pub const MAGIC_END: u32 = 0x0AB1_6F30;
pub const MAX_PAYLOAD: usize = 476;

pub const FLAG_NOT_MAIN_FLASH: u32 = 0x0000_0001;
pub const FLAG_FAMILY_ID_PRESENT: u32 = 0x0000_2000;

/// UF2 Family ID for RP2040
pub const RP2040_FAMILY_ID: u32 = 0xE48B_FF56;

/// Refuse to materialize images larger than this
const MAX_IMAGE_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Uf2Error {
    #[error("UF2 length {0} is not a multiple of 512")]
    Truncated(usize),
    #[error("Block {0} has bad magic")]
    BadMagic(usize),
    #[error("Block {index} declares payload of {size} bytes")]
    BadPayload { index: usize, size: u32 },
    #[error("UF2 contains no main-flash blocks")]
    Empty,
    #[error("Blocks span {0} bytes, image too large")]
    TooLarge(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uf2Block {
    pub flags: u32,
    pub target_addr: u32,
    pub family_id: Option<u32>,
    pub data: Vec<u8>,
}

/// Parsed UF2 file restricted to main-flash blocks
#[derive(Debug)]
pub struct Uf2Image {
    blocks: Vec<Uf2Block>,
}

fn word(block: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([block[offset], block[offset + 1], block[offset + 2], block[offset + 3]])
}

impl Uf2Image {
    pub fn parse(data: &[u8]) -> Result<Self, Uf2Error> {
        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            return Err(Uf2Error::Truncated(data.len()));
        }

        let mut blocks = Vec::new();
        for (index, block) in data.chunks_exact(BLOCK_SIZE).enumerate() {
            if word(block, 0) != MAGIC_START0 || word(block, 4) != MAGIC_START1 || word(block, 508) != MAGIC_END {
                return Err(Uf2Error::BadMagic(index));
            }

            let flags = word(block, 8);
            if flags & FLAG_NOT_MAIN_FLASH != 0 {
                continue;
            }

            let size = word(block, 16);
            if size as usize > MAX_PAYLOAD {
                return Err(Uf2Error::BadPayload { index, size });
            }

            let family_id = (flags & FLAG_FAMILY_ID_PRESENT != 0).then(|| word(block, 28));
            blocks.push(Uf2Block {
                flags,
                target_addr: word(block, 12),
                family_id,
                data: block[32..32 + size as usize].to_vec(),
            });
        }

        if blocks.is_empty() {
            return Err(Uf2Error::Empty);
        }
        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[Uf2Block] {
        &self.blocks
    }

    /// Lowest flash address written by the image
    pub fn base_address(&self) -> u32 {
        self.blocks.iter().map(|b| b.target_addr).min().unwrap_or(0)
    }

    pub fn family_id(&self) -> Option<u32> {
        self.blocks.iter().find_map(|b| b.family_id)
    }

    /// Contiguous binary starting at `base_address`
    pub fn to_binary(&self) -> Result<Vec<u8>, Uf2Error> {
        let base = self.base_address() as u64;
        let end = self
            .blocks
            .iter()
            .map(|b| b.target_addr as u64 + b.data.len() as u64)
            .max()
            .unwrap_or(base);
        let span = end - base;
        if span > MAX_IMAGE_SIZE {
            return Err(Uf2Error::TooLarge(span));
        }

        let mut image = vec![0xFFu8; span as usize];
        for block in &self.blocks {
            let offset = (block.target_addr as u64 - base) as usize;
            image[offset..offset + block.data.len()].copy_from_slice(&block.data);
        }
        Ok(image)
    }
}

/// Encode one UF2 block
pub fn encode_block(target_addr: u32, payload: &[u8], block_no: u32, num_blocks: u32, family_id: Option<u32>) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    let flags = if family_id.is_some() { FLAG_FAMILY_ID_PRESENT } else { 0 };
    let len = payload.len().min(MAX_PAYLOAD);

    block[0..4].copy_from_slice(&MAGIC_START0.to_le_bytes());
    block[4..8].copy_from_slice(&MAGIC_START1.to_le_bytes());
    block[8..12].copy_from_slice(&flags.to_le_bytes());
    block[12..16].copy_from_slice(&target_addr.to_le_bytes());
    block[16..20].copy_from_slice(&(len as u32).to_le_bytes());
    block[20..24].copy_from_slice(&block_no.to_le_bytes());
    block[24..28].copy_from_slice(&num_blocks.to_le_bytes());
    block[28..32].copy_from_slice(&family_id.unwrap_or(0).to_le_bytes());
    block[32..32 + len].copy_from_slice(&payload[..len]);
    block[508..512].copy_from_slice(&MAGIC_END.to_le_bytes());
    block
}

/// Encode a flat binary as UF2 with 256-byte payloads (the RP2040 convention)
pub fn encode(binary: &[u8], base_address: u32, family_id: Option<u32>) -> Vec<u8> {
    let chunks: Vec<&[u8]> = binary.chunks(256).collect();
    let num_blocks = chunks.len() as u32;
    chunks
        .iter()
        .enumerate()
        .flat_map(|(i, chunk)| {
            encode_block(base_address + (i as u32) * 256, chunk, i as u32, num_blocks, family_id)
        })
        .collect()
}
