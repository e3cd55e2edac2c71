mod common;

use common::*;
use probelink_lib::constants::{DESCRIPTOR_MAGIC, DESCRIPTOR_TABLE_SIZE};

#[test]
fn test_table_is_blob_reversed_at_full_size() {
    let raw: Vec<u8> = (0..DESCRIPTOR_TABLE_SIZE).map(|i| (i ^ (i >> 8)) as u8).collect();
    let blob = DescriptorBlob::from_bytes(raw.clone(), DESCRIPTOR_TABLE_SIZE).unwrap();
    let table = DescriptorTable::build(&blob);

    assert_eq!(table.read(0), Some(raw[2047]));
    assert_eq!(table.read(1), Some(raw[2046]));
    assert_eq!(table.read(2047), Some(raw[0]));
    assert_eq!(table.read(2048), None);
    assert_eq!(table.last_index(), 2047);
}

#[test]
fn test_header_only_descriptor_layout() {
    let spec = DescriptorSpec {
        timebase_ps: 1,
        depth: 0x200,
        width: 0x80,
        channels: Vec::new(),
    };
    let table = DescriptorTable::from_spec(&spec, DESCRIPTOR_TABLE_SIZE).unwrap();
    let bytes = table.as_bytes();
    let start = DESCRIPTOR_TABLE_SIZE - 20;

    assert!(bytes[..start].iter().all(|&b| b == 0));
    assert_eq!(&bytes[start..start + 8], DESCRIPTOR_MAGIC);
    // DEBUGROM, timebase 1, depth 0x200, width 0x80
    assert_eq!(bytes[start..], hex_to_bytes("4445425547524f4d000000010000020000000080")[..]);

    let parsed = DescriptorSpec::from_table(bytes).unwrap();
    assert_eq!(parsed, spec);
}

#[test]
fn test_spec_from_json() {
    let json = r#"{
        "timebase_ps": 20000,
        "depth": 1024,
        "width": 32,
        "channels": [
            { "name": "data", "width": 16 },
            { "name": "addr", "width": 15, "format": 0 },
            { "name": "valid", "width": 1 }
        ]
    }"#;
    let spec = DescriptorSpec::from_json(json).unwrap();
    assert_eq!(spec.channels.len(), 3);
    assert_eq!(spec.channels[0], ChannelRecord::new("data", 16));
    assert!((spec.sample_period_s() - 20e-9).abs() < 1e-15);

    let table = DescriptorTable::from_spec(&spec, 512).unwrap();
    assert_eq!(DescriptorSpec::from_table(table.as_bytes()).unwrap(), spec);
}

#[test]
fn test_json_with_bad_widths_rejected() {
    let json = r#"{ "timebase_ps": 1, "depth": 1, "width": 8,
                    "channels": [ { "name": "a", "width": 4 } ] }"#;
    assert!(matches!(
        DescriptorSpec::from_json(json),
        Err(ProbeError::ChannelWidthMismatch { expected: 8, actual: 4 })
    ));
    assert!(matches!(DescriptorSpec::from_json("{"), Err(ProbeError::Json(_))));
}

#[test]
fn test_from_table_rejects_garbage() {
    assert!(matches!(DescriptorSpec::from_table(&[0u8; 64]), Err(ProbeError::MissingMagic)));

    let mut table = vec![0u8; 64];
    table[40..48].copy_from_slice(b"NOTMAGIC");
    assert!(matches!(DescriptorSpec::from_table(&table), Err(ProbeError::MissingMagic)));

    // Magic present but the header is cut short.
    let mut table = vec![0u8; 32];
    table[20..28].copy_from_slice(DESCRIPTOR_MAGIC);
    assert!(matches!(DescriptorSpec::from_table(&table), Err(ProbeError::Truncated { .. })));
}

#[test]
fn test_display_lists_bit_ranges() {
    let spec = DescriptorSpec {
        timebase_ps: 10_000,
        depth: 256,
        width: 9,
        channels: vec![ChannelRecord::new("byte", 8), ChannelRecord::new("strobe", 1)],
    };
    let text = spec.to_string();
    assert!(text.contains("Timebase: 10000 ps"));
    assert!(text.contains("[   7:0   ] byte"));
    assert!(text.contains("[   8:8   ] strobe"));
}

#[test]
fn test_zero_width_channel() {
    let spec = DescriptorSpec {
        timebase_ps: 1_000,
        depth: 64,
        width: 8,
        channels: vec![ChannelRecord::new("gap", 0), ChannelRecord::new("bus", 8)],
    };
    assert!(matches!(spec.validate(), Err(ProbeError::ZeroWidthChannel(ref name)) if name == "gap"));
    assert!(matches!(spec.to_blob(64), Err(ProbeError::ZeroWidthChannel(_))));

    // A device may still report one; decoding and printing must not fail.
    let mut table = vec![0u8; 44];
    table.extend_from_slice(&hex_to_bytes("4445425547524f4d000003e80000004000000008"));
    table.extend_from_slice(b"gap\0\x00\x00bus\0\x08\x00");
    let parsed = DescriptorSpec::from_table(&table).unwrap();
    assert_eq!(parsed.channels, spec.channels);
    assert!(parsed.validate().is_err());

    let text = parsed.to_string();
    assert!(text.contains("[   -:-   ] gap"));
    assert!(text.contains("[   7:0   ] bus"));
}

#[test]
fn test_empty_table_rejected() {
    assert!(matches!(DescriptorBlob::from_bytes(Vec::new(), 0), Err(ProbeError::EmptyTable)));
    let spec = DescriptorSpec {
        timebase_ps: 1,
        depth: 1,
        width: 8,
        channels: Vec::new(),
    };
    assert!(spec.to_blob(0).is_err());
}
