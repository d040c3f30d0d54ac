//! Bit-exact wire formats for transactions and blocks
//!
//! Everything variable-length is length-prefixed so parsing never depends
//! on delimiters: lengths below 128 occupy one byte, larger lengths are
//! `0x80 | n` followed by `n` big-endian length bytes. Integers travel as
//! minimal big-endian byte strings, length-prefixed like any other field.

use crate::error::WireError;

/// Transaction carrying a standard contract-call header
pub const TX_TYPE_CONTRACT: u8 = 1;
/// Protocol-reserved transaction updating the validator-node set; binds to
/// the node key instead of an account key.
pub const TX_TYPE_VALIDATOR_UPDATE: u8 = 2;

pub fn encode_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = (len as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let tail = &bytes[skip..];
    out.push(0x80 | tail.len() as u8);
    out.extend_from_slice(tail);
}

pub fn decode_length(input: &mut &[u8]) -> Result<usize, WireError> {
    let (&first, rest) = input.split_first().ok_or(WireError::TruncatedLength)?;
    if first < 0x80 {
        *input = rest;
        return Ok(first as usize);
    }
    let width = (first & 0x7f) as usize;
    if width == 0 || width > 8 {
        return Err(WireError::OversizedInteger { length: width });
    }
    if rest.len() < width {
        return Err(WireError::TruncatedLength);
    }
    let mut value = 0u64;
    for &b in &rest[..width] {
        value = (value << 8) | b as u64;
    }
    *input = &rest[width..];
    Ok(value as usize)
}

pub fn encode_bytes(out: &mut Vec<u8>, data: &[u8]) {
    encode_length(out, data.len());
    out.extend_from_slice(data);
}

pub fn decode_bytes(input: &mut &[u8]) -> Result<Vec<u8>, WireError> {
    let len = decode_length(input)?;
    if input.len() < len {
        return Err(WireError::LengthOverrun { length: len });
    }
    let (field, rest) = input.split_at(len);
    *input = rest;
    Ok(field.to_vec())
}

/// Integers are carried as their minimal big-endian two's-complement u64
/// image, so negative account ids survive the round trip.
pub fn encode_int(out: &mut Vec<u8>, value: i64) {
    let bytes = (value as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    encode_bytes(out, &bytes[skip.min(7)..]);
}

pub fn decode_int(input: &mut &[u8]) -> Result<i64, WireError> {
    let field = decode_bytes(input)?;
    int_from_bytes(&field)
}

pub fn int_from_bytes(field: &[u8]) -> Result<i64, WireError> {
    if field.len() > 8 {
        return Err(WireError::OversizedInteger { length: field.len() });
    }
    let mut value = 0u64;
    for &b in field {
        value = (value << 8) | b as u64;
    }
    Ok(value as i64)
}

/// Parsed standard-header transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTransaction {
    pub tx_type: u8,
    pub time: i64,
    pub key_id: i64,
    pub ecosystem_id: i64,
    pub token_ecosystem: i64,
    /// Per-transaction fuel override; zero means none
    pub max_fuel: i64,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub contract: String,
    /// Declared-parameter values in schema order
    pub raw_params: Vec<Vec<u8>>,
}

impl ParsedTransaction {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.tx_type];
        encode_int(&mut out, self.time);
        encode_int(&mut out, self.key_id);
        encode_int(&mut out, self.ecosystem_id);
        encode_int(&mut out, self.token_ecosystem);
        encode_int(&mut out, self.max_fuel);
        encode_bytes(&mut out, &self.public_key);
        encode_bytes(&mut out, &self.signature);
        encode_bytes(&mut out, self.contract.as_bytes());
        encode_length(&mut out, self.raw_params.len());
        for param in &self.raw_params {
            encode_bytes(&mut out, param);
        }
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        let mut input = body;
        let (&tx_type, rest) = input.split_first().ok_or(WireError::TruncatedLength)?;
        if tx_type != TX_TYPE_CONTRACT && tx_type != TX_TYPE_VALIDATOR_UPDATE {
            return Err(WireError::UnknownTxType { tag: tx_type });
        }
        input = rest;
        let time = decode_int(&mut input)?;
        let key_id = decode_int(&mut input)?;
        let ecosystem_id = decode_int(&mut input)?;
        let token_ecosystem = decode_int(&mut input)?;
        let max_fuel = decode_int(&mut input)?;
        let public_key = decode_bytes(&mut input)?;
        let signature = decode_bytes(&mut input)?;
        let contract = String::from_utf8(decode_bytes(&mut input)?)
            .map_err(|_| WireError::TruncatedField { expected: 0 })?;
        let count = decode_length(&mut input)?;
        let mut raw_params = Vec::with_capacity(count);
        for _ in 0..count {
            raw_params.push(decode_bytes(&mut input)?);
        }
        Ok(Self {
            tx_type,
            time,
            key_id,
            ecosystem_id,
            token_ecosystem,
            max_fuel,
            public_key,
            signature,
            contract,
            raw_params,
        })
    }

    /// Read the type tag and caller id without parsing the whole body
    pub fn peek_type_and_key(body: &[u8]) -> Result<(u8, i64), WireError> {
        let mut input = body;
        let (&tx_type, rest) = input.split_first().ok_or(WireError::TruncatedLength)?;
        input = rest;
        let _time = decode_int(&mut input)?;
        let key_id = decode_int(&mut input)?;
        Ok((tx_type, key_id))
    }
}

/// Block header fields carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub version: i64,
    pub block_id: i64,
    pub time: i64,
    pub ecosystem_id: i64,
    pub key_id: i64,
    pub node_position: i64,
    pub sign: Vec<u8>,
}

impl BlockHeader {
    /// Canonical string the proposer signs
    pub fn for_sign(&self, prev_hash: &[u8], merkle_root: &[u8]) -> String {
        format!(
            "{},{},{},{},{},{},{},{}",
            self.version,
            self.block_id,
            hex::encode(prev_hash),
            self.time,
            self.ecosystem_id,
            self.key_id,
            self.node_position,
            hex::encode(merkle_root),
        )
    }

    /// Canonical string whose double hash is the header identity
    pub fn for_hash(&self, prev_hash: &[u8], merkle_root: &[u8]) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.block_id,
            hex::encode(prev_hash),
            hex::encode(merkle_root),
            self.time,
            self.ecosystem_id,
            self.key_id,
            self.node_position,
        )
    }
}

/// Encode a block: header fields then the length-prefixed transaction list
pub fn encode_block(header: &BlockHeader, tx_bodies: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    encode_int(&mut out, header.version);
    encode_int(&mut out, header.block_id);
    encode_int(&mut out, header.time);
    encode_int(&mut out, header.ecosystem_id);
    encode_int(&mut out, header.key_id);
    encode_int(&mut out, header.node_position);
    encode_bytes(&mut out, &header.sign);
    for body in tx_bodies {
        encode_bytes(&mut out, body);
    }
    out
}

/// Parse a block into its header and transaction bodies
pub fn parse_block(data: &[u8]) -> Result<(BlockHeader, Vec<Vec<u8>>), WireError> {
    let mut input = data;
    let header = BlockHeader {
        version: decode_int(&mut input)?,
        block_id: decode_int(&mut input)?,
        time: decode_int(&mut input)?,
        ecosystem_id: decode_int(&mut input)?,
        key_id: decode_int(&mut input)?,
        node_position: decode_int(&mut input)?,
        sign: decode_bytes(&mut input)?,
    };
    let mut tx_bodies = Vec::new();
    while !input.is_empty() {
        tx_bodies.push(decode_bytes(&mut input)?);
    }
    Ok((header, tx_bodies))
}
