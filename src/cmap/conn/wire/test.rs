use pretty_assertions::assert_eq;

use super::{
    decode_reply,
    Header,
    Message,
    MessageFlags,
    OpCode,
    Query,
    QueryFlags,
    Reply,
    ReplyFlags,
};
use crate::{bson::doc, error::ErrorKind};

#[test]
fn op_msg_layout() {
    let document = doc! { "ping": 1, "$db": "admin" };
    let message = Message::new(document.clone(), MessageFlags::MORE_TO_COME);
    let bytes = message.to_bytes().unwrap();

    let mut doc_bytes = Vec::new();
    document.to_writer(&mut doc_bytes).unwrap();

    assert_eq!(bytes.len(), Header::LENGTH + 4 + 1 + doc_bytes.len());
    assert_eq!(&bytes[0..4], &(bytes.len() as i32).to_le_bytes());
    assert_eq!(&bytes[4..8], &message.request_id.to_le_bytes());
    assert_eq!(&bytes[8..12], &0i32.to_le_bytes());
    assert_eq!(&bytes[12..16], &2013i32.to_le_bytes());
    assert_eq!(&bytes[16..20], &2u32.to_le_bytes());
    assert_eq!(bytes[20], 0);
    assert_eq!(&bytes[21..], &doc_bytes[..]);

    assert_eq!(Message::from_bytes(&bytes).unwrap(), message);
}

#[test]
fn request_ids_increase() {
    let first = Message::new(doc! {}, MessageFlags::empty());
    let second = Message::new(doc! {}, MessageFlags::empty());
    assert!(second.request_id > first.request_id);
}

#[test]
fn op_msg_checksum_and_sequences() {
    let body = doc! { "insert": "coll", "$db": "db" };
    let seq_docs = [doc! { "x": 1 }, doc! { "x": 2 }];

    let mut sections = vec![0u8];
    body.to_writer(&mut sections).unwrap();

    let mut seq = Vec::new();
    seq.extend_from_slice(b"documents\0");
    for d in &seq_docs {
        d.to_writer(&mut seq).unwrap();
    }
    sections.push(1);
    sections.extend_from_slice(&((seq.len() + 4) as i32).to_le_bytes());
    sections.extend_from_slice(&seq);

    let flags = MessageFlags::CHECKSUM_PRESENT;
    let total = Header::LENGTH + 4 + sections.len() + 4;
    let mut bytes = Vec::new();
    Header {
        length: total as i32,
        request_id: 7,
        response_to: 3,
        op_code: OpCode::Message,
    }
    .write_to(&mut bytes);
    bytes.extend_from_slice(&flags.bits().to_le_bytes());
    bytes.extend_from_slice(&sections);
    bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

    let (header, document) = decode_reply(&bytes).unwrap();
    assert_eq!(header.response_to, 3);
    assert_eq!(
        document,
        doc! { "insert": "coll", "$db": "db", "documents": [{ "x": 1 }, { "x": 2 }] }
    );
}

#[test]
fn op_msg_requires_body() {
    let mut bytes = Vec::new();
    Header {
        length: (Header::LENGTH + 4) as i32,
        request_id: 1,
        response_to: 0,
        op_code: OpCode::Message,
    }
    .write_to(&mut bytes);
    bytes.extend_from_slice(&0u32.to_le_bytes());

    let error = decode_reply(&bytes).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidResponse { .. }));
}

#[test]
fn op_query_layout() {
    let query = Query::command(
        "admin",
        doc! { "$query": { "ping": 1 }, "$readPreference": { "mode": "secondary" } },
        QueryFlags::SECONDARY_OK,
    );
    let bytes = query.to_bytes().unwrap();

    assert_eq!(&bytes[12..16], &2004i32.to_le_bytes());
    assert_eq!(&bytes[16..20], &4u32.to_le_bytes());
    assert_eq!(&bytes[20..31], b"admin.$cmd\0");
    assert_eq!(&bytes[31..35], &0i32.to_le_bytes());
    assert_eq!(&bytes[35..39], &(-1i32).to_le_bytes());

    let decoded = Query::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, query);
}

#[test]
fn op_reply_decoding() {
    let reply = Reply::new(12, doc! { "ok": 1, "n": 3 });
    let (header, document) = decode_reply(&reply.to_bytes().unwrap()).unwrap();
    assert_eq!(header.op_code, OpCode::Reply);
    assert_eq!(header.response_to, 12);
    assert_eq!(document, doc! { "ok": 1, "n": 3 });

    let mut failure = Reply::new(13, doc! { "$err": "not authorized", "code": 13 });
    failure.flags = ReplyFlags::QUERY_FAILURE;
    let error = decode_reply(&failure.to_bytes().unwrap()).unwrap_err();
    match *error.kind {
        ErrorKind::Command(ref command_error) => {
            assert_eq!(command_error.code, 13);
            assert_eq!(command_error.message, "not authorized");
        }
        ref other => panic!("expected command error, got {other:?}"),
    }
}

#[test]
fn length_mismatch() {
    let mut bytes = Message::new(doc! { "ok": 1 }, MessageFlags::empty())
        .to_bytes()
        .unwrap();
    bytes.push(0);
    assert!(decode_reply(&bytes).is_err());
}
