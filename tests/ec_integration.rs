//! EC Integration Tests
//!
//! Block sealing, codec jobs on the worker pool and decoding with missing
//! fragments, without the transfer layer.

use bytes::Bytes;

use raidmesh::domain::BackupId;
use raidmesh::ec::{lookup, EccRegistry, FragmentCodec};
use raidmesh::pipeline::{BlockCipher, BlockLayout, MasterKey, PlainBlock, SealedBlock};
use raidmesh::worker::{Job, JobOutput, PoolConfig, WorkerPool};

fn block(payload: &[u8], last: bool) -> PlainBlock {
    PlainBlock {
        backup_id: BackupId::from("F1"),
        block_number: 7,
        payload: Bytes::copy_from_slice(payload),
        last,
    }
}

fn pool() -> WorkerPool {
    WorkerPool::new(PoolConfig {
        workers: 2,
        queue_capacity: 4,
        fault_injector: None,
    })
    .unwrap()
}

// =============================================================================
// Seal -> Make -> Read -> Open
// =============================================================================

#[tokio::test]
async fn test_sealed_block_survives_data_loss_through_pool() {
    let map = lookup("ecc/4x4").unwrap();
    let layout = BlockLayout::new(map.data_fragments(), 32).unwrap();
    let cipher = BlockCipher::new(&MasterKey::generate());
    let plain = block(b"a block that needs parity to come back", true);
    let sealed = plain.seal(&layout, &cipher).unwrap();
    assert_eq!(sealed.bytes.len(), layout.sealed_len());

    let pool = pool();
    let made = pool
        .run(Job::Make {
            backup_id: plain.backup_id.clone(),
            block_number: plain.block_number,
            map: map.clone(),
            sealed: sealed.bytes.clone(),
            fragment_size: layout.wire_fragment_size(),
        })
        .await
        .unwrap();
    let JobOutput::Made(encoded) = made else {
        panic!("expected encoded fragments");
    };

    let mut data: Vec<Option<Bytes>> = encoded.data.into_iter().map(Some).collect();
    let parity: Vec<Option<Bytes>> = encoded.parity.into_iter().map(Some).collect();
    data[0] = None;
    data[3] = None;

    let read = pool
        .run(Job::Read {
            backup_id: plain.backup_id.clone(),
            block_number: plain.block_number,
            map,
            data,
            parity,
            sealed_len: layout.sealed_len(),
        })
        .await
        .unwrap();
    let JobOutput::Read { sealed: bytes, degraded } = read else {
        panic!("expected a decoded block");
    };
    assert!(degraded);

    let opened = SealedBlock {
        backup_id: plain.backup_id.clone(),
        block_number: plain.block_number,
        bytes,
    }
    .open(&layout, &cipher)
    .unwrap();
    assert_eq!(opened, plain);
}

#[tokio::test]
async fn test_tampered_fragment_fails_authentication() {
    let map = lookup("ecc/2x2").unwrap();
    let layout = BlockLayout::new(map.data_fragments(), 16).unwrap();
    let cipher = BlockCipher::new(&MasterKey::generate());
    let plain = block(b"integrity", false);
    let sealed = plain.seal(&layout, &cipher).unwrap();

    let codec = FragmentCodec::new(map);
    let encoded = codec
        .encode(&sealed.bytes, layout.wire_fragment_size())
        .unwrap();
    let mut tampered = encoded.data[1].to_vec();
    tampered[0] ^= 0xff;
    let data = vec![Some(encoded.data[0].clone()), Some(Bytes::from(tampered))];
    let parity = encoded.parity.into_iter().map(Some).collect();
    let recovered = codec.decode(data, parity).unwrap();

    let reopened = SealedBlock {
        backup_id: plain.backup_id.clone(),
        block_number: plain.block_number,
        bytes: raidmesh::ec::join(&recovered, layout.sealed_len()),
    }
    .open(&layout, &cipher);
    assert!(reopened.is_err());
}

// =============================================================================
// Every Built-in Scheme
// =============================================================================

#[test]
fn test_every_scheme_recovers_one_lost_data_fragment() {
    let registry = EccRegistry::builtin();
    for name in registry.names() {
        let map = registry.lookup(name).unwrap();
        let d = map.data_fragments();
        let codec = FragmentCodec::new(map.clone());
        let block: Vec<u8> = (0..d * 8).map(|i| (i * 7 + 3) as u8).collect();
        let encoded = codec.encode(&block, 8).unwrap();

        for lost in 0..d {
            let mut data: Vec<Option<Bytes>> = encoded.data.iter().cloned().map(Some).collect();
            data[lost] = None;
            let parity = encoded.parity.iter().cloned().map(Some).collect();
            let recovered = codec
                .decode(data, parity)
                .unwrap_or_else(|e| panic!("{} lost d{}: {}", name, lost, e));
            assert_eq!(recovered, encoded.data, "{} lost d{}", name, lost);
        }
    }
}

#[test]
fn test_oracle_agrees_with_decoder_for_4x4() {
    let map = lookup("ecc/4x4").unwrap();
    let codec = FragmentCodec::new(map.clone());
    let block: Vec<u8> = (0..64u8).collect();
    let encoded = codec.encode(&block, 16).unwrap();

    for mask in 0u32..(1 << 8) {
        let present: Vec<bool> = (0..8).map(|i| mask & (1 << i) != 0).collect();
        let pick = |frags: &[Bytes], offset: usize| -> Vec<Option<Bytes>> {
            frags
                .iter()
                .enumerate()
                .map(|(i, f)| present[offset + i].then(|| f.clone()))
                .collect()
        };
        let result = codec.decode(pick(&encoded.data, 0), pick(&encoded.parity, 4));
        assert_eq!(
            result.is_ok(),
            map.is_fixable(&present[..4], &present[4..]),
            "mask {:08b}",
            mask
        );
        if let Ok(recovered) = result {
            assert_eq!(recovered, encoded.data);
        }
    }
}
