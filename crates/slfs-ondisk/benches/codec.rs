use criterion::{Criterion, black_box, criterion_group, criterion_main};
use slfs_ondisk::{BlockKind, SsbBlock, SsbEntry, ssb_checksum};
use slfs_types::{BlockNumber, ImapEntry, InodeNumber, SSB_ENTRIES_PER_BLOCK, Version};

fn bench_imap_codec(c: &mut Criterion) {
    c.bench_function("imap_encode_decode", |b| {
        b.iter(|| {
            let mut acc = 0_u32;
            for i in 0..256_u32 {
                let entry =
                    ImapEntry::encode(black_box(BlockNumber(i * 37)), Version(i), (i % 16) as u8);
                acc ^= entry.block().0 ^ u32::from(entry.version()) ^ u32::from(entry.slot());
            }
            acc
        });
    });
}

fn bench_ssb_block(c: &mut Criterion) {
    let entries: Vec<SsbEntry> = (0..SSB_ENTRIES_PER_BLOCK as u32)
        .map(|i| SsbEntry {
            kind: BlockKind::Data,
            inum: InodeNumber(i % 200),
            offset: i,
            version: Version(i / 7),
        })
        .collect();

    c.bench_function("ssb_checksum_full_block", |b| {
        b.iter(|| ssb_checksum(black_box(&entries)));
    });

    let ssb = SsbBlock {
        timestamp: 1,
        next_seg_addr: 0,
        entries,
    };
    let block = ssb.to_block();
    c.bench_function("ssb_parse_full_block", |b| {
        b.iter(|| SsbBlock::parse(black_box(&block)).expect("parse"));
    });
}

criterion_group!(benches, bench_imap_codec, bench_ssb_block);
criterion_main!(benches);
