//! A stand-in for the BCH engine.
//!
//! Rather than computing a real code, the encoder records what it was asked to store and the
//! decoder compares the page read back against that record: a chunk with no more bit errors than
//! the strength is corrected, anything beyond is reported uncorrectable.

use crate::gpmi::bch::{BchGeometry, STATUS_ERASED, STATUS_UNCORRECTABLE};
use crate::util::PageUtil;

/// Result of decoding one raw page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub payload: Vec<u8>,
    pub metadata: Vec<u8>,
    /// One status byte per chunk: bits corrected, [STATUS_ERASED] or [STATUS_UNCORRECTABLE]
    pub status: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct SimBch {
    geometry: BchGeometry,
}

impl SimBch {
    pub fn new(geometry: BchGeometry) -> Self {
        Self { geometry }
    }

    /// Build the raw page the engine sends to the chip, and the record the decoder later checks
    /// against: the payload followed by the metadata.
    pub fn encode(&self, payload: &[u8], metadata: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let geo = &self.geometry;
        let mut raw = vec![0xFF; geo.raw_page_size()];
        raw[..geo.page_size].copy_from_slice(&payload[..geo.page_size]);
        raw[geo.page_size..geo.page_size + geo.metadata_size]
            .copy_from_slice(&metadata[..geo.metadata_size]);

        // Filler parity, so programmed pages never look erased
        let parity_start = geo.page_size + geo.metadata_size;
        let parity = &mut raw[parity_start..parity_start + geo.parity_size()];
        for (i, byte) in parity.iter_mut().enumerate() {
            *byte = payload
                .iter()
                .skip(i)
                .step_by(geo.parity_size().max(1))
                .fold(0x5A, |acc, b| acc ^ b);
        }

        let mut shadow = payload[..geo.page_size].to_vec();
        shadow.extend_from_slice(&metadata[..geo.metadata_size]);
        (raw, shadow)
    }

    /// Chunk `n` of a page (payload, then metadata for the first chunk)
    fn chunk<'a>(&self, page: &'a [u8], meta: &'a [u8], n: usize) -> (&'a [u8], &'a [u8]) {
        let size = self.geometry.chunk_size;
        let data = &page[n * size..(n + 1) * size];
        match n {
            0 => (data, meta),
            _ => (data, &[]),
        }
    }

    /// Decode a raw page read from the chip
    pub fn decode(&self, raw: &[u8], shadow: Option<&[u8]>) -> Decoded {
        let geo = &self.geometry;
        let (raw_payload, raw_oob) = raw.split_at(geo.page_size);
        let raw_meta = &raw_oob[..geo.metadata_size];

        let mut payload = raw_payload.to_vec();
        let mut metadata = raw_meta.to_vec();
        let mut status = Vec::with_capacity(geo.chunk_count);

        for n in 0..geo.chunk_count {
            let (data, meta) = self.chunk(raw_payload, raw_meta, n);
            let Some(shadow) = shadow else {
                // Nothing was stored through the engine; only an erased chunk decodes cleanly
                status.push(match data.is_erased() && meta.is_erased() {
                    true => STATUS_ERASED,
                    false => 0,
                });
                continue;
            };

            let (expected_payload, expected_meta) = shadow.split_at(geo.page_size);
            let (want_data, want_meta) = self.chunk(expected_payload, expected_meta, n);
            let errors = data.bit_errors(want_data) + meta.bit_errors(want_meta);
            if errors > geo.ecc_strength {
                status.push(STATUS_UNCORRECTABLE);
                continue;
            }

            let range = n * geo.chunk_size..(n + 1) * geo.chunk_size;
            payload[range].copy_from_slice(want_data);
            if n == 0 {
                metadata.copy_from_slice(want_meta);
            }
            status.push(errors as u8);
        }

        Decoded {
            payload,
            metadata,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_correct_up_to_strength() {
        let geo = BchGeometry::new(2048, 64).unwrap();
        let bch = SimBch::new(geo);
        let mut rng = SmallRng::seed_from_u64(7);
        let mut payload = vec![0; 2048];
        rng.fill(&mut payload[..]);
        let meta = [0x11; 10];

        let (mut raw, shadow) = bch.encode(&payload, &meta);
        assert_eq!(&raw[2048..2058], &meta);

        // Chunk 1: exactly the strength; chunk 2: one more
        for bit in 0..geo.ecc_strength {
            raw[512 + bit] ^= 1;
        }
        for bit in 0..=geo.ecc_strength {
            raw[1024 + bit] ^= 0x80;
        }
        // One error in the metadata counts against chunk 0
        raw[2050] ^= 0x01;

        let decoded = bch.decode(&raw, Some(&shadow));
        assert_eq!(
            decoded.status,
            [1, geo.ecc_strength as u8, STATUS_UNCORRECTABLE, 0]
        );
        assert_eq!(&decoded.payload[..1024], &payload[..1024]);
        assert_ne!(&decoded.payload[1024..1536], &payload[1024..1536]);
        assert_eq!(decoded.metadata, meta);
    }

    #[test]
    fn test_erased_without_record() {
        let bch = SimBch::new(BchGeometry::new(512, 16).unwrap());
        let raw = vec![0xFF; 528];
        let decoded = bch.decode(&raw, None);
        assert_eq!(decoded.status, [STATUS_ERASED]);
        assert!(decoded.payload.is_erased());

        let mut raw = raw;
        raw[3] = 0;
        assert_eq!(bch.decode(&raw, None).status, [0]);
    }
}
