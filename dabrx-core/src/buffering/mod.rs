//! Lock-free SPSC ring buffer for raw dongle bytes.
//!
//! Uses `ringbuf::HeapRb<u8>`: the producer half lives on the acquisition
//! thread (inside the driver callback), the consumer half is drained by
//! `DeviceSession::pull_samples`. Neither side takes a lock.
//!
//! | Operation   | ringbuf call                 |
//! |-------------|------------------------------|
//! | put         | `Producer::push_slice`       |
//! | get         | `Consumer::pop_slice`        |
//! | flush       | `Consumer::clear`            |
//! | available   | `Observer::occupied_len`     |

pub mod convert;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, owned by the acquisition thread.
pub type SampleProducer = ringbuf::HeapProd<u8>;

/// Consumer half, owned by whoever pulls samples.
pub type SampleConsumer = ringbuf::HeapCons<u8>;

/// Default capacity: 1 MiB of interleaved I/Q bytes, ≈ 256 ms at 2.048 MS/s.
pub const RING_CAPACITY: usize = 1024 * 1024;

/// Create a matched producer/consumer pair of `capacity` bytes.
pub fn create_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    HeapRb::<u8>::new(capacity.max(1)).split()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_accepts_at_most_capacity() {
        let (mut producer, consumer) = create_sample_ring(16);
        let accepted = producer.push_slice(&[7u8; 24]);
        assert_eq!(accepted, 16);
        assert_eq!(consumer.occupied_len(), 16);
    }

    #[test]
    fn get_is_fifo_and_non_blocking() {
        let (mut producer, mut consumer) = create_sample_ring(32);
        let mut out = [0u8; 8];
        assert_eq!(consumer.pop_slice(&mut out), 0);

        producer.push_slice(&[1, 2, 3, 4, 5]);
        let n = consumer.pop_slice(&mut out);
        assert_eq!(n, 5);
        assert_eq!(&out[..n], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn flush_discards_everything() {
        let (mut producer, mut consumer) = create_sample_ring(32);
        producer.push_slice(&[9u8; 20]);
        consumer.clear();
        assert_eq!(consumer.occupied_len(), 0);

        // Ring is usable again after a flush.
        producer.push_slice(&[1, 2]);
        let mut out = [0u8; 4];
        assert_eq!(consumer.pop_slice(&mut out), 2);
    }

    #[test]
    fn producer_and_consumer_run_on_separate_threads() {
        let (mut producer, mut consumer) = create_sample_ring(64);
        let writer = std::thread::spawn(move || {
            let mut sent = 0u32;
            while sent < 10_000 {
                let byte = (sent % 251) as u8;
                if producer.push_slice(&[byte]) == 1 {
                    sent += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut received = 0u32;
        let mut out = [0u8; 16];
        while received < 10_000 {
            let n = consumer.pop_slice(&mut out);
            for byte in &out[..n] {
                assert_eq!(*byte, (received % 251) as u8);
                received += 1;
            }
            if n == 0 {
                std::thread::yield_now();
            }
        }
        writer.join().expect("writer thread panicked");
    }
}
