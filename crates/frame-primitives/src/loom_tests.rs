#![cfg(all(test, feature = "loom"))]

use crate::buffer::{StreamBuffer, WaitPolicy};
use crate::copy::{ByteCopy, CopyConfig};
use crate::region::HeapRegion;
use crate::sync::thread;
use loom::sync::Arc;

fn byte_at_a_time() -> CopyConfig {
    CopyConfig {
        chunk_len: 1,
        copy: &ByteCopy,
    }
}

#[test]
fn published_prefix_is_visible() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(256));
        let region = region_owner.region();
        let buffer = unsafe { StreamBuffer::init(region, 0, 16) };
        let buffer = Arc::new(buffer);

        let producer_buffer = buffer.clone();
        let producer_owner = region_owner.clone();
        let producer = thread::spawn(move || {
            let _keep = producer_owner;
            let (mut writer, _) = producer_buffer.split_with_copy(byte_at_a_time());
            writer.prepare(1);
            writer.write(&[0xAB, 0xCD]).unwrap();
        });

        let consumer_buffer = buffer.clone();
        let consumer_owner = region_owner.clone();
        let consumer = thread::spawn(move || {
            let _keep = consumer_owner;
            let (_, mut reader) = consumer_buffer.split_with_copy(byte_at_a_time());
            while reader.available() < 1 {
                thread::yield_now();
            }
            let mut byte = [0u8; 1];
            reader.read(&mut byte, &WaitPolicy::immediate()).unwrap();
            assert_eq!(byte[0], 0xAB);
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    });
}

#[test]
fn offset_never_decreases_between_prepares() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(256));
        let region = region_owner.region();
        let buffer = unsafe { StreamBuffer::init(region, 0, 16) };
        let buffer = Arc::new(buffer);

        let producer_buffer = buffer.clone();
        let producer_owner = region_owner.clone();
        let producer = thread::spawn(move || {
            let _keep = producer_owner;
            let (mut writer, _) = producer_buffer.split_with_copy(byte_at_a_time());
            writer.prepare(1);
            writer.write(&[1, 2, 3]).unwrap();
        });

        let sampler_buffer = buffer.clone();
        let sampler_owner = region_owner.clone();
        let sampler = thread::spawn(move || {
            let _keep = sampler_owner;
            let first = sampler_buffer.published();
            let second = sampler_buffer.published();
            assert!(second >= first);
        });

        producer.join().unwrap();
        sampler.join().unwrap();
    });
}
