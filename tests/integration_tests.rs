use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use limonka::crypto::{keygen_manual, CryptoEngine, KeyType, Keyslot, SeedDb};
use limonka::fileio::{shared, ConcatFile, SubFile};
use limonka::ncch::exefs::{decompress_code, ExeFsReader};
use limonka::smdh::Smdh;
use limonka::tmd::{SignatureType, Tmd};
use limonka::FromBytes;

use hex_literal::hex;

#[test]
fn engine_end_to_end_key_derivation() {
    let mut engine = CryptoEngine::new(false);
    engine.set_keyslot_int(KeyType::X, Keyslot::Ncch as u8, 0x1111_2222_3333_4444);
    engine.set_keyslot_bytes(
        KeyType::Y,
        Keyslot::Ncch as u8,
        hex!("aabbccddeeff00112233445566778899"),
    );

    let expected = keygen_manual(
        0x1111_2222_3333_4444,
        u128::from_be_bytes(hex!("aabbccddeeff00112233445566778899")),
    );
    let mut data = vec![0u8; 64];
    engine
        .create_ctr_cipher(Keyslot::Ncch as u8, 0)
        .unwrap()
        .apply(&mut data);

    let mut reference = vec![0u8; 64];
    let mut other = CryptoEngine::new(false);
    other.set_normal_key(Keyslot::Ncch as u8, expected);
    other
        .create_ctr_cipher(Keyslot::Ncch as u8, 0)
        .unwrap()
        .apply(&mut reference);

    assert_eq!(data, reference);
}

#[test]
fn cipher_views_compose_over_subfiles() {
    let mut engine = CryptoEngine::new(false);
    engine.set_normal_key(0x40, [0x5A; 16]);

    // encrypt a region in the middle of a larger buffer
    let mut backing = vec![0u8; 0x400];
    let plain = b"nested encrypted region".to_vec();
    {
        let mut enc = plain.clone();
        engine.create_ctr_cipher(0x40, 99).unwrap().apply(&mut enc);
        backing[0x100..0x100 + enc.len()].copy_from_slice(&enc);
    }

    let base = shared(Cursor::new(backing));
    let sub = SubFile::new(base, 0x100, 0x40);
    let mut view = engine
        .create_ctr_io(0x40, Box::new(sub), 99)
        .unwrap();
    let mut out = vec![0u8; plain.len()];
    view.read_exact(&mut out).unwrap();
    assert_eq!(out, plain);
}

#[test]
fn concat_file_spans_parts() {
    let a = Box::new(Cursor::new(b"hello ".to_vec()));
    let b = Box::new(Cursor::new(b"world".to_vec()));
    let mut cat = ConcatFile::new(vec![(a, 6), (b, 5)]);
    let mut all = String::new();
    cat.read_to_string(&mut all).unwrap();
    assert_eq!(all, "hello world");
    cat.seek(SeekFrom::Start(4)).unwrap();
    let mut four = [0u8; 4];
    cat.read_exact(&mut four).unwrap();
    assert_eq!(&four, b"o wo");
}

#[test]
fn seeddb_file_format() {
    let mut db = SeedDb::new();
    db.add(0x000400000FF3FF00, [7; 16]);
    db.add(0x000400000FF4FF00, [8; 16]);
    let mut raw = Vec::new();
    db.save(&mut raw).unwrap();
    assert_eq!(raw.len(), 0x10 + 2 * 0x20);
    assert_eq!(&raw[0..4], &2u32.to_le_bytes());

    let mut back = SeedDb::new();
    back.load(&mut Cursor::new(raw)).unwrap();
    assert_eq!(back.get(0x000400000FF4FF00), Some([8; 16]));
}

#[test]
fn sd_iv_reference_vector() {
    assert_eq!(
        CryptoEngine::sd_path_to_iv("/title/00040000/00000002/content/00000000.app"),
        0x4f7c865046506736f75aae10fb2f8706
    );
}

#[test]
fn exefs_over_a_stream() {
    // assemble a raw ExeFS image by hand
    let mut image = vec![0u8; 0x400];
    image[0..5].copy_from_slice(b"logo\0");
    image[8..12].copy_from_slice(&0u32.to_le_bytes());
    image[12..16].copy_from_slice(&11u32.to_le_bytes());
    image[0x200..0x20B].copy_from_slice(b"logo pixels");

    let reader = ExeFsReader::new(shared(Cursor::new(image))).unwrap();
    assert_eq!(reader.read_file("logo").unwrap(), b"logo pixels");
}

#[test]
fn lzss_passthrough() {
    let mut raw = b"not actually compressed".to_vec();
    raw.extend_from_slice(&[0u8; 8]);
    assert_eq!(decompress_code(&raw).unwrap(), raw);
}

#[test]
fn tmd_round_trip_through_public_api() {
    // minimal RSA-2048-SHA256 TMD with zero contents
    let mut raw = Vec::new();
    raw.extend_from_slice(&0x10004u32.to_be_bytes());
    raw.extend_from_slice(&[0xAA; 0x13C]);
    let mut body = vec![0u8; 0xC4];
    body[..4].copy_from_slice(b"Root");
    body[0x4C..0x54].copy_from_slice(&0x0004000000055D00u64.to_be_bytes());
    raw.extend_from_slice(&body);
    raw.extend_from_slice(&vec![0u8; 64 * 0x24]);

    let tmd = Tmd::from_bytes(&raw).unwrap();
    assert_eq!(tmd.sig_type(), SignatureType::Rsa2048Sha256);
    assert_eq!(tmd.body().content_count(), 0);
    assert_eq!(tmd.to_bytes(), raw);
}

#[test]
fn smdh_from_raw_bytes() {
    let mut raw = vec![0u8; 0x36C0];
    raw[0..4].copy_from_slice(b"SMDH");
    // English short description at the second title slot
    let text: Vec<u8> = "Example"
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    raw[0x208..0x208 + text.len()].copy_from_slice(&text);

    let smdh = Smdh::from_bytes(&raw).unwrap();
    assert_eq!(
        smdh.title(limonka::smdh::Language::English)
            .short_desc()
            .to_string_lossy(),
        "Example"
    );
    let icon = smdh.small_icon();
    assert_eq!(icon.len(), 24);
    assert!(icon.iter().all(|row| row.len() == 24));
}

#[test]
fn subfile_contract_from_outside() {
    let base = shared(Cursor::new(vec![1u8; 0x100]));
    let mut sub = SubFile::new(base, 0x10, 0x10);
    sub.seek(SeekFrom::Start(0x20)).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(sub.read(&mut buf).unwrap(), 0);
    assert_eq!(sub.write(&[1, 2, 3]).unwrap(), 0);
}
