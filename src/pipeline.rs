//! Shared map/reduce driver.
//!
//! Every pipeline runs one mapper task and one reducer task per shard inside
//! a single worker pool; the bounded channel matrix from `transport` is the
//! inter-communicator. Termination is part of the wire protocol: each mapper
//! writes an empty line and closes its streams, and a reducer is done when
//! every inbound stream has delivered its marker. The join at the end of the
//! pool is the final cross-shard barrier: no output is installed until every
//! reducer has returned.

use crate::transport::{channel_grid, Collator, RecordStream};
use anyhow::{anyhow, Result};

pub fn run<M, R, T>(shards: usize, map_fn: M, reduce_fn: R) -> Result<Vec<T>>
where
    M: Fn(usize, &mut [RecordStream]) -> Result<()> + Sync,
    R: Fn(usize, Collator) -> Result<T> + Sync,
    T: Send,
{
    let (senders, receivers) = channel_grid(shards);
    let mut map_results: Vec<Result<()>> = Vec::new();
    let mut reduce_results: Vec<Result<T>> = Vec::new();

    std::thread::scope(|scope| {
        let map_fn = &map_fn;
        let reduce_fn = &reduce_fn;

        let map_handles: Vec<_> = senders
            .into_iter()
            .enumerate()
            .map(|(shard, row)| {
                scope.spawn(move || -> Result<()> {
                    let mut streams: Vec<RecordStream> =
                        row.into_iter().map(RecordStream::new).collect();
                    map_fn(shard, &mut streams)?;
                    for stream in &mut streams {
                        stream.finish()?;
                    }
                    Ok(())
                })
            })
            .collect();

        let reduce_handles: Vec<_> = receivers
            .into_iter()
            .enumerate()
            .map(|(shard, inbound)| scope.spawn(move || reduce_fn(shard, Collator::new(inbound))))
            .collect();

        map_results = map_handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow!("mapper task panicked")))
            })
            .collect();
        reduce_results = reduce_handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow!("reducer task panicked")))
            })
            .collect();
    });

    for r in map_results {
        r?;
    }
    reduce_results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{decode_f32, encode_f32};

    #[test]
    fn shuffle_routes_by_target() {
        // Every mapper sends (mapper, value) to target = value % shards; each
        // reducer sums what it receives.
        let shards = 3usize;
        let sums = run(
            shards,
            |mapper, streams: &mut [RecordStream]| {
                for v in 0..30u32 {
                    let target = (v as usize) % streams.len();
                    streams[target].write_line(&format!("{mapper} {}", encode_f32(v as f32)))?;
                }
                Ok(())
            },
            |_, mut collator| {
                let mut sum = 0.0f32;
                let mut senders = [false; 3];
                while let Some(line) = collator.next_line()? {
                    let mut parts = line.split(' ');
                    let mapper: usize = parts.next().unwrap().parse()?;
                    senders[mapper] = true;
                    sum += decode_f32(parts.next().unwrap())?;
                }
                assert!(senders.iter().all(|&s| s), "records from every mapper");
                Ok(sum)
            },
        )
        .unwrap();

        // Each reducer r receives values congruent to r, once per mapper.
        for (r, sum) in sums.iter().enumerate() {
            let expect: f32 = (0..30u32)
                .filter(|v| v % 3 == r as u32)
                .map(|v| v as f32)
                .sum();
            assert_eq!(*sum, expect * 3.0);
        }
    }

    #[test]
    fn mapper_failure_fails_the_pipeline() {
        let result = run(
            2,
            |shard, streams: &mut [RecordStream]| {
                if shard == 1 {
                    anyhow::bail!("synthetic mapper failure");
                }
                streams[0].write_line("0 AAAAAA==")?;
                Ok(())
            },
            |_, mut collator| {
                while collator.next_line()?.is_some() {}
                Ok(())
            },
        );
        assert!(result.is_err());
    }
}
