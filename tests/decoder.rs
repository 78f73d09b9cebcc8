//! Wire-level decoder tests against known Candid encodings, including the
//! official prim/construct/reference test suite vectors.

use candid::Principal;
use identify_broker::candid_decode::{CandidValue, NameLookup, decode, field_hash};
use num_bigint::{BigInt, BigUint};

fn lookup() -> NameLookup {
    NameLookup::from_names([
        "Ok",
        "Err",
        "head",
        "tail",
        "from_subaccount",
        "to",
        "owner",
        "memo",
        "amount",
        "fee",
        "subaccount",
        "created_at_time",
    ])
}

fn ok(buffer: &[u8]) -> Vec<CandidValue> {
    decode(buffer, None).expect("expected successful decode")
}

fn err_offset(buffer: &[u8]) -> usize {
    decode(buffer, None).expect_err("expected decode error").error.offset
}

fn field<'a>(fields: &'a [(identify_broker::candid_decode::FieldLabel, CandidValue)], name: &str) -> &'a CandidValue {
    let hash = field_hash(name);
    &fields
        .iter()
        .find(|(label, _)| label.id == hash)
        .unwrap_or_else(|| panic!("missing field {name}"))
        .1
}

#[test]
fn nullary_and_trailing() {
    assert_eq!(ok(b"DIDL\x00\x00"), vec![]);
    // Nullary with a trailing byte fails.
    assert!(decode(b"DIDL\x00\x00\x00", None).is_err());
    // Missing magic fails at offset 0.
    assert_eq!(err_offset(b"DADL\x00\x00"), 0);
    assert!(decode(b"", None).is_err());
}

#[test]
fn overlong_header_counts_are_accepted() {
    assert_eq!(ok(b"DIDL\x80\x00\x00"), vec![]);
    assert_eq!(ok(b"DIDL\x00\x80\x00"), vec![]);
}

#[test]
fn null_bool_reserved() {
    assert_eq!(ok(b"DIDL\x00\x01\x7f"), vec![CandidValue::Null]);
    assert_eq!(ok(b"DIDL\x00\x01\x70"), vec![CandidValue::Null]);
    assert!(decode(b"DIDL\x00\x01\x7f\x00", None).is_err());
    assert_eq!(ok(b"DIDL\x00\x01\x7e\x00"), vec![CandidValue::Bool(false)]);
    assert_eq!(ok(b"DIDL\x00\x01\x7e\x01"), vec![CandidValue::Bool(true)]);
    assert!(decode(b"DIDL\x00\x01\x7e", None).is_err());
    assert!(decode(b"DIDL\x00\x01\x7e\x02", None).is_err());
    // Empty has no values.
    assert!(decode(b"DIDL\x00\x01\x6f", None).is_err());
}

#[test]
fn nat_leb128() {
    assert_eq!(ok(b"DIDL\x00\x01\x7d\x00"), vec![CandidValue::Nat(0u8.into())]);
    assert_eq!(ok(b"DIDL\x00\x01\x7d\x7f"), vec![CandidValue::Nat(127u8.into())]);
    assert_eq!(ok(b"DIDL\x00\x01\x7d\x80\x01"), vec![CandidValue::Nat(128u8.into())]);
    assert_eq!(ok(b"DIDL\x00\x01\x7d\xff\x7f"), vec![CandidValue::Nat(16383u16.into())]);
    // Overlong value encoding is fine.
    assert_eq!(ok(b"DIDL\x00\x01\x7d\x80\x00"), vec![CandidValue::Nat(0u8.into())]);
    assert_eq!(
        ok(b"DIDL\x00\x01\x7d\x80\x80\x98\xf4\xe9\xb5\xca\x6a"),
        vec![CandidValue::Nat(BigUint::from(60_000_000_000_000_000u64))]
    );
    // Unterminated LEB fails past the last byte.
    assert_eq!(err_offset(b"DIDL\x00\x01\x7d\x80"), 8);
}

#[test]
fn int_sleb128() {
    assert_eq!(ok(b"DIDL\x00\x01\x7c\x00"), vec![CandidValue::Int(0.into())]);
    assert_eq!(ok(b"DIDL\x00\x01\x7c\x7f"), vec![CandidValue::Int((-1).into())]);
    assert_eq!(ok(b"DIDL\x00\x01\x7c\x40"), vec![CandidValue::Int((-64).into())]);
    assert_eq!(ok(b"DIDL\x00\x01\x7c\x80\x01"), vec![CandidValue::Int(128.into())]);
    assert_eq!(ok(b"DIDL\x00\x01\x7c\xff\x00"), vec![CandidValue::Int(127.into())]);
    assert_eq!(
        ok(b"DIDL\x00\x01\x7c\x80\x7f"),
        vec![CandidValue::Int(BigInt::from(-128))]
    );
    assert!(decode(b"DIDL\x00\x01\x7c\x80", None).is_err());
}

#[test]
fn fixed_width_numbers() {
    assert_eq!(ok(b"DIDL\x00\x01\x7b\xff"), vec![CandidValue::Nat8(255)]);
    assert!(decode(b"DIDL\x00\x01\x7b", None).is_err());
    assert_eq!(ok(b"DIDL\x00\x01\x7a\xff\xff"), vec![CandidValue::Nat16(65535)]);
    assert!(decode(b"DIDL\x00\x01\x7a\x00\x00\x00", None).is_err());
    assert_eq!(
        ok(b"DIDL\x00\x01\x79\xff\xff\xff\xff"),
        vec![CandidValue::Nat32(4_294_967_295)]
    );
    assert_eq!(
        ok(b"DIDL\x00\x01\x78\xff\xff\xff\xff\xff\xff\xff\xff"),
        vec![CandidValue::Nat64(u64::MAX)]
    );
    assert_eq!(ok(b"DIDL\x00\x01\x77\xff"), vec![CandidValue::Int8(-1)]);
    assert_eq!(ok(b"DIDL\x00\x01\x76\xff\xff"), vec![CandidValue::Int16(-1)]);
    assert_eq!(
        ok(b"DIDL\x00\x01\x75\xff\xff\xff\xff"),
        vec![CandidValue::Int32(-1)]
    );
    assert_eq!(
        ok(b"DIDL\x00\x01\x74\xff\xff\xff\xff\xff\xff\xff\xff"),
        vec![CandidValue::Int64(-1)]
    );
}

#[test]
fn floats() {
    assert_eq!(ok(b"DIDL\x00\x01\x73\x00\x00\x40\x40"), vec![CandidValue::Float32(3.0)]);
    assert_eq!(ok(b"DIDL\x00\x01\x73\x00\x00\x00\xbf"), vec![CandidValue::Float32(-0.5)]);
    assert!(decode(b"DIDL\x00\x01\x73\x00\x00", None).is_err());
    assert_eq!(
        ok(b"DIDL\x00\x01\x72\x00\x00\x00\x00\x00\x00\xe0\xbf"),
        vec![CandidValue::Float64(-0.5)]
    );
    match &ok(b"DIDL\x00\x01\x72\x01\x00\x00\x00\x00\x00\xf0\x7f")[0] {
        CandidValue::Float64(value) => assert!(value.is_nan()),
        other => panic!("expected float64, got {other:?}"),
    }
}

#[test]
fn text() {
    assert_eq!(ok(b"DIDL\x00\x01\x71\x00"), vec![CandidValue::Text(String::new())]);
    assert_eq!(
        ok(b"DIDL\x00\x01\x71\x06Motoko"),
        vec![CandidValue::Text("Motoko".into())]
    );
    // Declared length out of step with the payload fails either way.
    assert!(decode(b"DIDL\x00\x01\x71\x05Motoko", None).is_err());
    assert!(decode(b"DIDL\x00\x01\x71\x07Motoko", None).is_err());
    assert_eq!(
        ok(b"DIDL\x00\x01\x71\x03\xe2\x98\x83"),
        vec![CandidValue::Text("\u{2603}".into())]
    );
    assert!(decode(b"DIDL\x00\x01\x71\x03\xe2\x28\xa1", None).is_err());
}

#[test]
fn multiple_arguments() {
    let values = ok(
        b"DIDL\x00\x0a\x7f\x7e\x7d\x7c\x7f\x70\x7f\x7b\x7a\x79\x01\x2a\x2a\x2a\x2a\x00\x2a\x00\x00\x00",
    );
    assert_eq!(
        values,
        vec![
            CandidValue::Null,
            CandidValue::Bool(true),
            CandidValue::Nat(42u8.into()),
            CandidValue::Int(42.into()),
            CandidValue::Null,
            CandidValue::Null,
            CandidValue::Null,
            CandidValue::Nat8(42),
            CandidValue::Nat16(42),
            CandidValue::Nat32(42),
        ]
    );
}

#[test]
fn composite_tags_rejected_as_argument_types() {
    assert!(decode(b"DIDL\x00\x01\x6e", None).is_err());
    assert!(decode(b"DIDL\x00\x01\x5e", None).is_err());
    assert!(decode(b"DIDL\x00\x01\x69\x01\x03\xca\xff\xee", None).is_err());
}

#[test]
fn opt_of_empty() {
    assert_eq!(
        ok(b"DIDL\x01\x6e\x6f\x01\x00\x00"),
        vec![CandidValue::Opt(None)]
    );
}

#[test]
fn recursive_record_list() {
    let values = decode(
        b"DIDL\x02\x6e\x01\x6c\x02\xa0\xd2\xac\xa8\x04\x7c\x90\xed\xda\xe7\x04\x00\x01\x00\x01\x01\x01\x02\x01\x03\x01\x04\x00",
        Some(&lookup()),
    )
    .unwrap();
    // opt record { head = 1; tail = opt record { ... } }, four levels deep.
    let mut node = &values[0];
    for expected_head in 1..=4 {
        let CandidValue::Opt(Some(inner)) = node else {
            panic!("expected opt some at level {expected_head}");
        };
        let CandidValue::Record(fields) = inner.as_ref() else {
            panic!("expected record at level {expected_head}");
        };
        assert_eq!(
            field(fields, "head"),
            &CandidValue::Int(expected_head.into())
        );
        node = field(fields, "tail");
    }
    assert_eq!(node, &CandidValue::Opt(None));
}

#[test]
fn principal_values() {
    assert_eq!(
        ok(b"DIDL\x00\x01\x68\x01\x00"),
        vec![CandidValue::Principal(Principal::from_text("aaaaa-aa").unwrap())]
    );
    assert_eq!(
        ok(b"DIDL\x00\x01\x68\x01\x03\xca\xff\xee"),
        vec![CandidValue::Principal(Principal::from_text("w7x7r-cok77-xa").unwrap())]
    );
    assert_eq!(
        ok(b"DIDL\x00\x01\x68\x01\x09\xef\xcd\xab\x00\x00\x00\x00\x00\x01"),
        vec![CandidValue::Principal(
            Principal::from_text("2chl6-4hpzw-vqaaa-aaaaa-c").unwrap()
        )]
    );
    // Missing reference tag, truncated body, trailing byte, and a primitive
    // inside the type table all fail.
    assert!(decode(b"DIDL\x00\x01\x68\x03\xca\xff\xee", None).is_err());
    assert!(decode(b"DIDL\x00\x01\x68\x01\x03\xca\xff", None).is_err());
    assert!(decode(b"DIDL\x00\x01\x68\x01\x03\xca\xff\xee\xee", None).is_err());
    assert!(decode(b"DIDL\x01\x68\x01\x00\x01\x03\xca\xff\xee", None).is_err());
}

#[test]
fn service_values() {
    assert_eq!(
        ok(b"DIDL\x01\x69\x00\x01\x00\x01\x03\xca\xff\xee"),
        vec![CandidValue::Service(Principal::from_text("w7x7r-cok77-xa").unwrap())]
    );
    // Service with a method table.
    assert_eq!(
        ok(b"DIDL\x02\x6a\x01\x71\x01\x7d\x00\x69\x01\x03foo\x00\x01\x01\x01\x03\xca\xff\xee"),
        vec![CandidValue::Service(Principal::from_text("w7x7r-cok77-xa").unwrap())]
    );
}

#[test]
fn func_values() {
    assert_eq!(
        ok(b"DIDL\x01\x6a\x00\x00\x00\x01\x00\x01\x01\x03\xca\xff\xee\x01\x61"),
        vec![CandidValue::Func(
            Principal::from_text("w7x7r-cok77-xa").unwrap(),
            "a".into()
        )]
    );
    // The function reference tag must be 1.
    assert!(decode(
        b"DIDL\x01\x6a\x00\x00\x00\x01\x00\x01\x00\x03\xca\xff\xee\x01\x61",
        None
    )
    .is_err());
    assert_eq!(
        ok(b"DIDL\x01\x6a\x01\x71\x01\x7d\x01\x01\x01\x00\x01\x01\x03\xca\xff\xee\x03foo"),
        vec![CandidValue::Func(
            Principal::from_text("w7x7r-cok77-xa").unwrap(),
            "foo".into()
        )]
    );
}

#[test]
fn icrc1_transfer_argument() {
    let bytes = hex::decode(
        "4449444c066d7b6e006c02b3b0dac30368ad86ca8305016e7d6e786c06fbca0102c6fcb60203ba89e5c2\
         0401a2de94eb060182f3f3910c04d8a38ca80d7d0105011d5dd64083ce6039cdece839138afec5067f51\
         0c748f4faae09a5b011a020000000000808080f5ddb8ebe4b56c",
    )
    .unwrap();
    let values = decode(&bytes, Some(&lookup())).unwrap();
    assert_eq!(values.len(), 1);
    let CandidValue::Record(fields) = &values[0] else {
        panic!("expected record argument");
    };

    assert_eq!(
        field(fields, "amount"),
        &CandidValue::Nat(BigUint::parse_bytes(b"1000000000000000000000", 10).unwrap())
    );
    assert_eq!(field(fields, "fee"), &CandidValue::Opt(None));
    assert_eq!(field(fields, "memo"), &CandidValue::Opt(None));
    assert_eq!(field(fields, "from_subaccount"), &CandidValue::Opt(None));
    assert_eq!(field(fields, "created_at_time"), &CandidValue::Opt(None));

    let CandidValue::Record(to) = field(fields, "to") else {
        panic!("expected account record");
    };
    assert_eq!(
        field(to, "owner"),
        &CandidValue::Principal(
            Principal::from_text("6pfju-rc52z-aihtt-ahhg6-z2bzc-ofp5r-igp5i-qy5ep-j6vob-gs3ae-nae")
                .unwrap()
        )
    );
    assert_eq!(field(to, "subaccount"), &CandidValue::Opt(None));

    // Labels resolved through the lookup render by name, unknown ones by
    // hash.
    assert!(fields.iter().any(|(label, _)| label.to_string() == "amount"));

    // Fields come out sorted by hash.
    let mut hashes: Vec<u32> = fields.iter().map(|(label, _)| label.id).collect();
    let sorted = hashes.clone();
    hashes.sort_unstable();
    assert_eq!(hashes, sorted);
}

#[test]
fn error_offsets_are_byte_exact() {
    // Value truncated right after the type section: error points at the end
    // of the buffer.
    assert_eq!(err_offset(b"DIDL\x00\x01\x7d"), 7);
    assert_eq!(err_offset(b"DIDL\x00\x01\x7b"), 7);
}

#[test]
fn partial_values_survive_decode_errors() {
    // First argument decodes, second is truncated.
    let error = decode(b"DIDL\x00\x02\x7e\x7d\x01", None).unwrap_err();
    assert_eq!(error.partial, vec![CandidValue::Bool(true)]);
}

#[test]
fn record_field_wire_order_does_not_matter() {
    // record { 0: nat; 1: int } with table fields declared in and out of
    // hash order; the value section is identical in both encodings.
    let ascending = b"DIDL\x01\x6c\x02\x00\x7d\x01\x7c\x01\x00\x2a\x7f";
    let descending = b"DIDL\x01\x6c\x02\x01\x7c\x00\x7d\x01\x00\x2a\x7f";
    let expected = ok(ascending);
    assert_eq!(ok(descending), expected);
    let CandidValue::Record(fields) = &expected[0] else {
        panic!("expected record");
    };
    assert_eq!(fields[0].1, CandidValue::Nat(BigUint::from(42u8)));
    assert_eq!(fields[1].1, CandidValue::Int(BigInt::from(-1)));
}

#[test]
fn deep_opt_nesting_fails_without_crashing() {
    // opt referring back to itself; each 0x01 tag adds one nesting level.
    // Past the depth limit this must come back as an error, not blow the
    // stack.
    let mut buffer = b"DIDL\x01\x6e\x00\x01\x00".to_vec();
    buffer.extend(std::iter::repeat_n(0x01u8, 200_000));
    buffer.push(0x00);
    let error = decode(&buffer, None).unwrap_err();
    assert!(error.error.message.contains("nesting"));

    // Nesting below the limit still decodes.
    let mut shallow = b"DIDL\x01\x6e\x00\x01\x00".to_vec();
    shallow.extend(std::iter::repeat_n(0x01u8, 10));
    shallow.push(0x00);
    let values = decode(&shallow, None).unwrap();
    assert!(matches!(values[0], CandidValue::Opt(Some(_))));
}
