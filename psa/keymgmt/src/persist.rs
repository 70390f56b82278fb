// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Backing store record format of persistent keys.
//!
//! A record is a fixed header followed by the material. Keys held wrapped
//! for both directions store two blobs of `material_len` bytes each.

use azihsm_psa_interface::AssetPolicy;
use bitfield_struct::bitfield;
use zerocopy::little_endian::U16;
use zerocopy::little_endian::U32;
use zerocopy::little_endian::U64;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zeroize::Zeroizing;

use crate::algorithm::Algorithm;
use crate::algorithm::KeyType;
use crate::attributes::KeyAttributes;
use crate::attributes::KeyId;
use crate::attributes::KeyLifetime;
use crate::attributes::KeyPolicy;
use crate::attributes::KeyUsage;
use crate::slot::KeySlot;
use crate::KeyMgmtError;
use crate::KeyMgmtResult;

/// Record magic, "PSAK" read as a little-endian word.
pub(crate) const RECORD_MAGIC: u32 = 0x4B41_5350;

/// Current record version.
pub(crate) const RECORD_VERSION: u16 = 1;

#[bitfield(u16)]
#[derive(PartialEq, Eq, Hash)]
struct RecordFlags {
    bidirectional: bool,
    dual_material: bool,
    #[bits(14)]
    __: u16,
}

#[repr(C, packed)]
#[derive(Debug, IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy)]
struct RecordHeader {
    magic: U32,
    version: U16,
    flags: U16,
    id: U32,
    key_type: U16,
    bits: U16,
    lifetime: U32,
    usage: U32,
    alg: U32,
    alg2: U32,
    policy: U64,
    key_size: U32,
    modulus_bits: U32,
    exponent_bits: U32,
    source_key_id: U32,
    material_len: U32,
}

const RECORD_HEADER_LEN: usize = size_of::<RecordHeader>();

const _: () = assert!(RECORD_HEADER_LEN == 60);

fn narrow<T: TryFrom<usize>>(value: usize, field: &'static str) -> KeyMgmtResult<T> {
    T::try_from(value).map_err(|_| {
        tracing::error!(value, field, "Value does not fit in a record field");
        KeyMgmtError::InvalidArgument
    })
}

/// Serializes a slot holding material into a backing store record.
///
/// # Errors
/// * `KeyMgmtError::CorruptionDetected` - If the slot has no material or a
///   material part is missing.
/// * `KeyMgmtError::InvalidArgument` - If a field does not fit the record.
pub(crate) fn encode(slot: &KeySlot) -> KeyMgmtResult<Zeroizing<Vec<u8>>> {
    let parts: Vec<&[u8]> = slot.material[..slot.parts()]
        .iter()
        .map(|part| part.as_ref().map(|part| part.as_slice()))
        .collect::<Option<_>>()
        .ok_or_else(|| {
            tracing::error!(id = slot.id(), "Corruption: persisting a slot without material");
            KeyMgmtError::CorruptionDetected
        })?;

    let material_len = parts[0].len();
    if parts.iter().any(|part| part.len() != material_len) {
        tracing::error!(id = slot.id(), "Corruption: material parts differ in size");
        Err(KeyMgmtError::CorruptionDetected)?
    }

    let attributes = &slot.attributes;
    let flags = RecordFlags::new()
        .with_bidirectional(slot.bidirectional)
        .with_dual_material(parts.len() == 2);

    let header = RecordHeader {
        magic: U32::new(RECORD_MAGIC),
        version: U16::new(RECORD_VERSION),
        flags: U16::new(flags.into_bits()),
        id: U32::new(attributes.id),
        key_type: U16::new(slot.key_type()?.to_psa()),
        bits: U16::new(narrow(attributes.bits, "bits")?),
        lifetime: U32::new(attributes.lifetime.raw()),
        usage: U32::new(attributes.usage().into_bits()),
        alg: U32::new(attributes.policy.alg.map_or(0, Algorithm::to_psa)),
        alg2: U32::new(attributes.policy.alg2.map_or(0, Algorithm::to_psa)),
        policy: U64::new(slot.policy.bits()),
        key_size: U32::new(narrow(slot.key_size, "key_size")?),
        modulus_bits: U32::new(narrow(slot.modulus_bits, "modulus_bits")?),
        exponent_bits: U32::new(narrow(slot.exponent_bits, "exponent_bits")?),
        source_key_id: U32::new(slot.source_key_id),
        material_len: U32::new(narrow(material_len, "material_len")?),
    };

    let mut record = Zeroizing::new(Vec::with_capacity(
        RECORD_HEADER_LEN + material_len * parts.len(),
    ));
    record.extend_from_slice(header.as_bytes());
    for part in parts {
        record.extend_from_slice(part);
    }
    Ok(record)
}

fn corrupt(id: KeyId, reason: &'static str) -> KeyMgmtError {
    tracing::error!(id, reason, "Corruption: malformed key record");
    KeyMgmtError::CorruptionDetected
}

/// Rebuilds a slot from the backing store record of key `id`.
///
/// The slot is not in use and holds every material part of the record.
///
/// # Errors
/// * `KeyMgmtError::CorruptionDetected` - If the record is malformed or
///   belongs to another key.
pub(crate) fn decode(id: KeyId, data: &[u8]) -> KeyMgmtResult<KeySlot> {
    let (header, material) =
        RecordHeader::read_from_prefix(data).map_err(|_| corrupt(id, "short header"))?;

    if header.magic.get() != RECORD_MAGIC {
        Err(corrupt(id, "bad magic"))?
    }
    if header.version.get() != RECORD_VERSION {
        Err(corrupt(id, "unknown version"))?
    }
    if header.id.get() != id {
        Err(corrupt(id, "identifier mismatch"))?
    }

    let flags = RecordFlags::from_bits(header.flags.get());
    let part_count = if flags.dual_material() { 2 } else { 1 };
    let material_len = header.material_len.get() as usize;
    if material_len == 0 || material.len() != material_len * part_count {
        Err(corrupt(id, "material length mismatch"))?
    }

    let key_type = KeyType::from_psa(header.key_type.get())
        .map_err(|_| corrupt(id, "unknown key type"))?
        .ok_or_else(|| corrupt(id, "no key type"))?;
    let alg = Algorithm::from_psa(header.alg.get()).map_err(|_| corrupt(id, "unknown algorithm"))?;
    let alg2 =
        Algorithm::from_psa(header.alg2.get()).map_err(|_| corrupt(id, "unknown algorithm"))?;

    let attributes = KeyAttributes {
        id,
        key_type: Some(key_type),
        bits: header.bits.get() as usize,
        lifetime: KeyLifetime::from_raw(header.lifetime.get()),
        policy: KeyPolicy {
            usage: KeyUsage::from_bits(header.usage.get()),
            alg,
            alg2,
        },
    };

    let mut parts = material.chunks_exact(material_len);
    let mut slot = KeySlot {
        attributes,
        key_size: header.key_size.get() as usize,
        policy: AssetPolicy::from_bits(header.policy.get()),
        bidirectional: flags.bidirectional(),
        modulus_bits: header.modulus_bits.get() as usize,
        exponent_bits: header.exponent_bits.get() as usize,
        source_key_id: header.source_key_id.get(),
        ..Default::default()
    };
    for part in slot.material.iter_mut().take(part_count) {
        *part = parts.next().map(|data| Zeroizing::new(data.to_vec()));
    }

    if slot.parts() != part_count {
        Err(corrupt(id, "part count does not match the key"))?
    }
    Ok(slot)
}
