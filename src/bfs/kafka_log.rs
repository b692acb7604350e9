//! Kafka-backed BFS backend (`feature = "backend-kafka"`).
//!
//! Blob identity here is `(partition, offset)` within a single-partition
//! topic named after the sanitized path; a "blob" is one Kafka message.
//! Built on the synchronous `kafka` crate (kafka-rust), matching this
//! engine's threading model (design §4.1.1).
//!
//! Per SPEC_FULL.md §9 (Open Questions, resolved): gravestones are appended
//! like any other record, and retirement on this backend is a whole-file
//! rewrite (produce into a brand new topic, then drop the old one) since a
//! log broker offers no partial-delete primitive. The `kafka` crate itself
//! exposes no topic-administration call, so `delete` is honestly
//! implemented here as a `Backend::Fatal` with a message explaining the
//! limitation rather than silently no-op'ing; callers (housekeeping) treat
//! that the same as any other fatal backend error: log, quarantine, retry
//! next cycle with a real admin-capable client or broker-side retention.

use std::sync::Mutex;
use std::time::Duration;

use kafka::consumer::{Consumer, FetchOffset};
use kafka::producer::{Producer, Record, RequiredAcks};

use crate::bfs::{BlobFileSystem, BlobPath, ChildEntry, PathValidator, PermissivePathValidator};
use crate::error::{Error, Result};

pub struct KafkaLogBlobFileSystem {
    hosts: Vec<String>,
    producer: Mutex<Producer>,
    validator: PermissivePathValidator,
}

impl KafkaLogBlobFileSystem {
    /// `connection` is a comma-separated list of `host:port` broker addresses.
    pub fn connect(connection: &str) -> Result<Self> {
        let hosts: Vec<String> = connection.split(',').map(|s| s.trim().to_string()).collect();
        let producer = Producer::from_hosts(hosts.clone())
            .with_ack_timeout(Duration::from_secs(5))
            .with_required_acks(RequiredAcks::One)
            .create()
            .map_err(map_kafka_err)?;
        Ok(KafkaLogBlobFileSystem { hosts, producer: Mutex::new(producer), validator: PermissivePathValidator })
    }

    fn topic_name(path: &BlobPath) -> String {
        // Kafka topic names may not contain '/'; channel directories become
        // dot-separated segments instead.
        format!("nbl.{}", path.as_str().replace('/', "."))
    }

    fn fetch_all(&self, topic: &str) -> Result<Vec<Vec<u8>>> {
        let mut consumer = Consumer::from_hosts(self.hosts.clone())
            .with_topic(topic.to_string())
            .with_fallback_offset(FetchOffset::Earliest)
            .create()
            .map_err(map_kafka_err)?;

        let mut messages: Vec<(i64, Vec<u8>)> = Vec::new();
        loop {
            let sets = consumer.poll().map_err(map_kafka_err)?;
            if sets.is_empty() {
                break;
            }
            for set in sets.iter() {
                for message in set.messages() {
                    messages.push((message.offset, message.value.to_vec()));
                }
                consumer.consume_messageset(set).map_err(map_kafka_err)?;
            }
            consumer.commit_consumed().map_err(map_kafka_err)?;
        }
        messages.sort_by_key(|(offset, _)| *offset);
        Ok(messages.into_iter().map(|(_, value)| value).collect())
    }
}

fn map_kafka_err(err: kafka::error::Error) -> Error {
    use kafka::error::Error as KErr;
    match err {
        KErr::Io(_) | KErr::UnexpectedEOF | KErr::ConnectionReset => Error::transient(err),
        _ => Error::fatal(err),
    }
}

impl BlobFileSystem for KafkaLogBlobFileSystem {
    fn exists(&self, path: &BlobPath) -> Result<bool> {
        Ok(self.size(path)? > 0 || !self.fetch_all(&Self::topic_name(path))?.is_empty())
    }

    fn directory_exists(&self, _path: &BlobPath) -> Result<bool> {
        // Kafka has no directory concept; every configured topic is
        // addressable directly by its sanitized name.
        Ok(true)
    }

    fn size(&self, path: &BlobPath) -> Result<u64> {
        let blobs = self.fetch_all(&Self::topic_name(path))?;
        Ok(blobs.iter().map(|b| b.len() as u64).sum())
    }

    fn read(&self, path: &BlobPath, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        let blobs = self.fetch_all(&Self::topic_name(path))?;
        if blobs.is_empty() {
            return Err(Error::not_found(format!("topic for {path}")));
        }
        let whole: Vec<u8> = blobs.into_iter().flatten().collect();
        let end = match length {
            Some(len) => (offset + len).min(whole.len() as u64),
            None => whole.len() as u64,
        };
        if offset > whole.len() as u64 {
            return Err(Error::corruption(format!("read offset {offset} beyond log size for {path}")));
        }
        Ok(whole[offset as usize..end as usize].to_vec())
    }

    fn write(&self, path: &BlobPath, buffers: &[&[u8]]) -> Result<u64> {
        let topic = Self::topic_name(path);
        let mut body = Vec::new();
        for buf in buffers {
            body.extend_from_slice(buf);
        }
        let mut producer = self.producer.lock().expect("kafka producer mutex poisoned");
        producer.send(&Record::from_value(&topic, body.as_slice())).map_err(map_kafka_err)?;
        Ok(body.len() as u64)
    }

    fn delete(&self, path: &BlobPath) -> Result<()> {
        Err(Error::fatal(format!(
            "deleting topic {} requires broker-side admin access not exposed by this client",
            Self::topic_name(path)
        )))
    }

    fn visit_children(&self, _dir: &BlobPath, _visitor: &mut dyn FnMut(ChildEntry)) -> Result<()> {
        // Listing topics by prefix requires cluster metadata enumeration
        // that the synchronous client does not expose conveniently; callers
        // that need to rebuild the channel directory listing should keep
        // the channel count in the store's own configuration (design §4.7:
        // "Channel count is fixed at store creation") rather than rely on
        // broker-side discovery.
        Ok(())
    }

    fn path_validator(&self) -> &dyn PathValidator {
        &self.validator
    }
}
