use std::ffi::OsStr;

use shroud_crypto::{ContentCodec, MasterKey, NameCodec, DEFAULT_BLOCK_SIZE};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [512, 4096])]
fn bench_encrypt_block(bencher: divan::Bencher, size: usize) {
    let codec = ContentCodec::new(&MasterKey::generate()).unwrap();
    let file_id = [0xABu8; 16];
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            codec
                .encrypt_block(divan::black_box(&file_id), 0, divan::black_box(&data))
                .unwrap()
        });
}

#[divan::bench(args = [512, 4096])]
fn bench_decrypt_block(bencher: divan::Bencher, size: usize) {
    let codec = ContentCodec::new(&MasterKey::generate()).unwrap();
    let file_id = [0xABu8; 16];
    let encrypted = codec.encrypt_block(&file_id, 0, &make_data(size)).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            codec
                .decrypt_block(divan::black_box(&file_id), 0, divan::black_box(&encrypted))
                .unwrap()
        });
}

/// Whole-file cost of the reverse read path: every block of a 1 MiB file.
#[divan::bench]
fn bench_encrypt_file_1mib(bencher: divan::Bencher) {
    let codec = ContentCodec::new(&MasterKey::generate()).unwrap();
    let file_id = [0x01u8; 16];
    let data = make_data(1 << 20);
    bencher
        .counter(divan::counter::BytesCount::new(data.len()))
        .bench(|| {
            for (i, block) in data.chunks(DEFAULT_BLOCK_SIZE as usize).enumerate() {
                divan::black_box(codec.encrypt_block(&file_id, i as u64, block).unwrap());
            }
        });
}

#[divan::bench(args = [8, 64, 200])]
fn bench_encrypt_name(bencher: divan::Bencher, len: usize) {
    let codec = NameCodec::new(&MasterKey::generate(), true).unwrap();
    let name = "n".repeat(len);
    let iv = [7u8; 16];
    bencher.bench(|| {
        codec
            .encrypt_name(divan::black_box(OsStr::new(&name)), &iv)
            .unwrap()
    });
}

fn main() {
    divan::main();
}
