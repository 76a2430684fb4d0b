use assuan_ipc::codec::{escape_data, unescape_data, DataLineEncoder, LineBuffer};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

fn codec_benchmark(c: &mut Criterion) {
    // Every fourth byte needs escaping
    let data: Vec<u8> = (0..4096u32)
        .map(|i| if i % 4 == 0 { b'%' } else { b'a' + (i % 26) as u8 })
        .collect();

    c.bench_function("escape_data", |b| {
        b.iter(|| escape_data(black_box(&data)))
    });

    let escaped = escape_data(&data);
    c.bench_function("unescape_data", |b| {
        b.iter(|| unescape_data(black_box(&escaped)).unwrap())
    });

    c.bench_function("encode_data_lines", |b| {
        b.iter(|| {
            let mut encoder = DataLineEncoder::new();
            let mut lines = 0usize;
            encoder
                .push(black_box(&data), |_| {
                    lines += 1;
                    Ok(())
                })
                .unwrap();
            encoder
                .flush(|_| {
                    lines += 1;
                    Ok(())
                })
                .unwrap();
            lines
        })
    });

    let mut stream = Vec::new();
    for i in 0..256 {
        stream.extend_from_slice(format!("S PROGRESS {} 256\n", i).as_bytes());
    }
    c.bench_function("split_lines", |b| {
        b.iter_batched(
            || stream.clone(),
            |bytes| {
                let mut buffer = LineBuffer::new();
                buffer.extend(black_box(&bytes));
                let mut count = 0;
                while let Some(line) = buffer.take_line() {
                    line.unwrap();
                    count += 1;
                }
                count
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, codec_benchmark);
criterion_main!(benches);
