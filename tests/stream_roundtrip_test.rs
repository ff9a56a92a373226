//! Streams written over a real connection and read back in pieces

use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use versync::codec::{CodecRegistry, CompressionPolicy, RleCodec};
use versync::stream::{ConnectionSource, PlainFramer};
use versync::{Connection, DataIStream, DataOStream};

const MARKER: u32 = 0xfeed;

#[derive(Debug, Clone, PartialEq)]
enum Field {
    U32(u32),
    U64(u64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
}

fn field() -> impl Strategy<Value = Field> {
    prop_oneof![
        any::<u32>().prop_map(Field::U32),
        any::<u64>().prop_map(Field::U64),
        any::<bool>().prop_map(Field::Bool),
        "[a-z ]{0,64}".prop_map(Field::Text),
        // Long runs so the run-length codec has something to do.
        (any::<u8>(), 0usize..3000).prop_map(|(b, n)| Field::Blob(vec![b; n])),
        prop::collection::vec(any::<u8>(), 0..512).prop_map(Field::Blob),
    ]
}

/// Write `fields` to one end of a pair and read them back on the other.
fn transfer(fields: &[Field], threshold: usize, compress: bool) -> Vec<Field> {
    let (tx, rx) = Connection::pair().unwrap();
    let registry = Arc::new(CodecRegistry::builtin());

    let shape = fields.to_vec();
    let reader = thread::spawn(move || {
        let mut is = DataIStream::new(Box::new(ConnectionSource::new(rx, registry)));
        assert_eq!(is.read_u32().unwrap(), MARKER);
        let mut out = Vec::with_capacity(shape.len());
        for field in &shape {
            out.push(match field {
                Field::U32(_) => Field::U32(is.read_u32().unwrap()),
                Field::U64(_) => Field::U64(is.read_u64().unwrap()),
                Field::Bool(_) => Field::Bool(is.read_bool().unwrap()),
                Field::Text(_) => Field::Text(is.read_string().unwrap()),
                Field::Blob(_) => Field::Blob(is.read_bytes().unwrap()),
            });
        }
        assert!(is.is_exhausted().unwrap());
        out
    });

    let policy = if compress {
        CompressionPolicy::ALWAYS
    } else {
        CompressionPolicy::NEVER
    };
    let mut os = DataOStream::new(Box::new(PlainFramer::new()))
        .with_codec(Some(Box::new(RleCodec::new())), policy)
        .with_flush_threshold(threshold);
    os.enable(&[tx]);
    // The marker keeps the message non-empty.
    os.write_u32(MARKER).unwrap();
    for field in fields {
        match field {
            Field::U32(v) => os.write_u32(*v).unwrap(),
            Field::U64(v) => os.write_u64(*v).unwrap(),
            Field::Bool(v) => os.write_bool(*v).unwrap(),
            Field::Text(v) => os.write_str(v).unwrap(),
            Field::Blob(v) => os.write_bytes(v).unwrap(),
        }
    }
    os.disable();

    reader.join().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_fields_survive_chunking(
        fields in prop::collection::vec(field(), 0..40),
        threshold in 16usize..4096,
        compress in any::<bool>(),
    ) {
        let received = transfer(&fields, threshold, compress);
        prop_assert_eq!(received, fields);
    }
}

#[test]
fn test_single_large_blob_compressed() {
    let blob = Field::Blob(vec![7u8; 300_000]);
    let received = transfer(std::slice::from_ref(&blob), 8192, true);
    assert_eq!(received, vec![blob]);
}
