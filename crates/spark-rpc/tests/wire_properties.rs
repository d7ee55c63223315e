//! 线上格式与元数据编码的性质验证
//!
//! - **核心目标 (Why)**：对任意合法包，`unmarshal(marshal(p))` 在两种布局下逐字段还原；
//!   对任意元数据映射编码可逆，且任意截断输入只会得到错误，绝不 panic 或静默写坏目标。
//! - **设计手法 (How)**：以 Proptest 生成命令字、标志、保留位、会话号、路由键、负载与元数据的组合；
//!   数值 ID 布局不携带 URI，因此为它单独生成 `msg_id` 路由键。

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use spark_rpc::{
    Cmd, ErrorCode, FreeListPacketPool, IdPacketCodec, IdentityEncoder, JsonCodec, Metadata,
    Packet, PacketCodec, Protocol, UriPacketCodec, XorEncoder,
};

fn cmd() -> impl Strategy<Value = Cmd> {
    prop_oneof![Just(Cmd::Notify), Just(Cmd::Request), Just(Cmd::Response)]
}

fn metadata() -> impl Strategy<Value = Metadata> {
    prop::collection::btree_map(
        "[a-z\\-]{0,12}",
        prop::collection::vec("\\PC{0,16}", 0..4),
        0..5,
    )
    .prop_map(|entries| {
        let mut md = Metadata::new();
        for (key, values) in entries {
            md.set(key, values);
        }
        md
    })
}

fn header() -> impl Strategy<Value = (Cmd, u8, u8, u64)> {
    (cmd(), any::<u8>(), any::<u8>(), any::<u64>())
}

fn fill(packet: &mut Packet, (cmd, flag, reserved, session_id): (Cmd, u8, u8, u64)) {
    packet.set_cmd(cmd);
    packet.set_flag(flag);
    packet.set_reserved(reserved);
    packet.set_session_id(session_id);
}

fn round_trip(codec: &dyn PacketCodec, packet: &mut Packet) -> Packet {
    let frame = Bytes::copy_from_slice(codec.marshal(packet).expect("编码"));
    let mut decoded = Packet::new();
    codec.unmarshal(frame, &mut decoded).expect("解码");
    decoded
}

proptest! {
    #[test]
    fn uri_layout_round_trips_every_field(
        head in header(),
        uri in "[a-zA-Z0-9./_]{0,64}",
        payload in prop::collection::vec(any::<u8>(), 0..256),
        md in metadata(),
    ) {
        let mut packet = Packet::new();
        fill(&mut packet, head);
        packet.set_uri(&uri);
        packet.set_payload(payload);
        packet.set_metadata(md);
        let decoded = round_trip(&UriPacketCodec::default(), &mut packet);
        prop_assert_eq!(decoded, packet);
    }

    #[test]
    fn id_layout_round_trips_every_field(
        head in header(),
        msg_id in any::<u32>(),
        payload in prop::collection::vec(any::<u8>(), 0..256),
        md in metadata(),
    ) {
        let mut packet = Packet::new();
        fill(&mut packet, head);
        packet.set_msg_id(msg_id);
        packet.set_payload(payload);
        packet.set_metadata(md);
        let decoded = round_trip(&IdPacketCodec::default(), &mut packet);
        prop_assert_eq!(decoded, packet);
    }

    #[test]
    fn obfuscated_frames_round_trip(
        key in prop::collection::vec(any::<u8>(), 1..16),
        uri in "[a-z]{1,16}",
        payload in prop::collection::vec(any::<u8>(), 0..128),
    ) {
        let protocol = Protocol::new(
            JsonCodec,
            Arc::new(UriPacketCodec::default()),
            Arc::new(XorEncoder::new(key).expect("非空密钥")),
            Arc::new(FreeListPacketPool::new()),
        );
        let mut packet = Packet::new();
        packet.set_cmd(Cmd::Request);
        packet.set_uri(&uri);
        packet.set_payload(payload);
        let frame = BytesMut::from(&protocol.marshal_frame(&mut packet).expect("成帧")[..]);
        let mut decoded = Packet::new();
        protocol.unmarshal_frame(frame, &mut decoded).expect("解帧");
        prop_assert_eq!(decoded, packet);
    }

    #[test]
    fn metadata_round_trips(md in metadata()) {
        let bytes = md.marshal().expect("编码");
        prop_assert_eq!(bytes.len(), md.encoded_len());
        prop_assert_eq!(Metadata::unmarshal(&bytes).expect("解码"), md);
    }

    #[test]
    fn truncated_metadata_is_size_invalid(md in metadata(), cut in any::<prop::sample::Index>()) {
        let bytes = md.marshal().expect("编码");
        prop_assume!(!bytes.is_empty());
        let cut = cut.index(bytes.len());
        let err = Metadata::unmarshal(&bytes[..cut]);
        // 恰好截在条目边界时得到的是更短但合法的映射。
        if let Err(err) = err {
            prop_assert!(err.is(ErrorCode::MetadataSize));
        }
    }

    #[test]
    fn arbitrary_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..96)) {
        let protocol = Protocol::new(
            JsonCodec,
            Arc::new(UriPacketCodec::default()),
            Arc::new(IdentityEncoder),
            Arc::new(FreeListPacketPool::new()),
        );
        let mut packet = Packet::new();
        let _ = protocol.unmarshal_frame(BytesMut::from(&data[..]), &mut packet);
        let _ = IdPacketCodec::default().unmarshal(Bytes::from(data), &mut packet);
    }
}
