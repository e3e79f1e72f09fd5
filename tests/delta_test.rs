//! Delta encoding: appending a re-encoded overlay to its base buffer
//! yields a valid document equal to the mutation.

use djson::{apply_delta, Encoder, MutableDict, ValueRef};

#[global_allocator]
static ALLOCATOR: mockalloc::Mockalloc<std::alloc::System> =
    mockalloc::Mockalloc(std::alloc::System);

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn encode_name_vehicle() -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.begin_dict();
    enc.write_key("Name");
    enc.write_string("totoro");
    enc.write_key("Vehicle");
    enc.write_string("catbus");
    enc.end_dict();
    enc.finish()
}

#[mockalloc::test]
fn encoding_mutable_array_delta() {
    let mut enc = Encoder::new();
    enc.begin_array();
    enc.write_string("totoro");
    enc.write_string("catbus");
    enc.end_array();
    let base = enc.finish();

    let source = ValueRef::from_bytes(&base).unwrap().as_array().unwrap();
    let mut ma = djson::MutableArray::from_array(source);
    ma.append("mei");

    let mut enc = Encoder::new();
    enc.set_base(&base);
    enc.reuse_base_strings();
    enc.write_value(ma.as_value());
    let delta = enc.finish();

    // Unchanged elements are pointers into the base, not copies.
    assert!(!contains(&delta, b"totoro"));
    assert!(!contains(&delta, b"catbus"));

    let doc = apply_delta(&base, &delta);
    let arr = ValueRef::from_bytes(&doc).unwrap().as_array().unwrap();
    assert_eq!(arr.count(), 3);
    assert_eq!(arr.get(0).unwrap().as_str(), Some("totoro"));
    assert_eq!(arr.get(1).unwrap().as_str(), Some("catbus"));
    assert_eq!(arr.get(2).unwrap().as_str(), Some("mei"));
}

#[mockalloc::test]
fn encoding_mutable_dict_delta() {
    let base = encode_name_vehicle();
    let original = ValueRef::from_bytes(&base).unwrap().as_dict().unwrap();
    assert_eq!(
        original.value().to_json(),
        "{\"Name\":\"totoro\",\"Vehicle\":\"catbus\"}"
    );

    let mut update = MutableDict::from_dict(original);
    assert_eq!(update.count(), 2);
    update.set("Friend", "catbus");
    assert_eq!(update.count(), 3);
    update.set("Vehicle", "top");
    assert_eq!(update.count(), 3);

    let mut it = update.iter();
    let (k, v) = it.next().unwrap();
    assert_eq!((k, v.as_str()), ("Friend", Some("catbus")));
    let (k, v) = it.next().unwrap();
    assert_eq!((k, v.as_str()), ("Name", Some("totoro")));
    let (k, v) = it.next().unwrap();
    assert_eq!((k, v.as_str()), ("Vehicle", Some("top")));
    assert!(it.next().is_none());

    let mut enc = Encoder::new();
    enc.set_base(&base);
    enc.reuse_base_strings();
    enc.write_value(update.as_value());
    let delta = enc.finish();

    // Keys and equal strings are shared with the base by pointer.
    assert!(!contains(&delta, b"totoro"));
    assert!(!contains(&delta, b"catbus"));
    assert!(!contains(&delta, b"Name"));
    assert!(!contains(&delta, b"Vehicle"));
    assert!(contains(&delta, b"Friend"));

    let doc = apply_delta(&base, &delta);
    let new_dict = ValueRef::from_bytes(&doc).unwrap().as_dict().unwrap();
    assert_eq!(
        new_dict.value().to_json(),
        "{\"Friend\":\"catbus\",\"Name\":\"totoro\",\"Vehicle\":\"top\"}"
    );
}

fn encode_person() -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.begin_dict();
    enc.write_key("age");
    enc.write_int(30);
    enc.write_key("city");
    enc.write_string("Matsugo");
    enc.write_key("friends");
    enc.begin_array();
    enc.begin_dict();
    enc.write_key("name");
    enc.write_string("satsuki");
    enc.end_dict();
    enc.begin_dict();
    enc.write_key("name");
    enc.write_string("kanta");
    enc.end_dict();
    enc.end_array();
    enc.write_key("name");
    enc.write_string("mei");
    enc.write_key("species");
    enc.write_string("human");
    enc.end_dict();
    enc.finish()
}

#[mockalloc::test]
fn deeply_nested_mutation() {
    let base = encode_person();
    let person = ValueRef::from_bytes(&base).unwrap().as_dict().unwrap();

    let mut mp = MutableDict::from_dict(person);
    mp.set("age", 31);
    let mut friends = mp.get_mutable_array("friends").unwrap();
    let mut frend = friends.get_mutable_dict(1).unwrap();
    frend.set("name", "Reddy Kill-a-Watt");

    let mut enc = Encoder::new();
    enc.set_base(&base);
    enc.reuse_base_strings();
    enc.write_value(mp.as_value());
    let delta = enc.finish();

    // friends[0] is untouched: its subtree is reused, not rewritten.
    assert!(!contains(&delta, b"satsuki"));
    assert!(!contains(&delta, b"Matsugo"));

    let doc = apply_delta(&base, &delta);
    let new_person = ValueRef::from_bytes(&doc).unwrap().as_dict().unwrap();
    assert_eq!(new_person.count(), 5);
    assert_eq!(new_person.get("age").unwrap().as_int(), 31);
    assert_eq!(new_person.get("city").unwrap().as_str(), Some("Matsugo"));
    assert_eq!(new_person.get("name").unwrap().as_str(), Some("mei"));
    let new_friends = new_person.get("friends").unwrap().as_array().unwrap();
    assert_eq!(new_friends.count(), 2);
    let f0 = new_friends.get(0).unwrap().as_dict().unwrap();
    assert_eq!(f0.get("name").unwrap().as_str(), Some("satsuki"));
    let f1 = new_friends.get(1).unwrap().as_dict().unwrap();
    assert_eq!(
        f1.get("name").unwrap().as_str(),
        Some("Reddy Kill-a-Watt")
    );
    assert_eq!(
        new_person.value().to_json(),
        "{\"age\":31,\"city\":\"Matsugo\",\"friends\":[{\"name\":\"satsuki\"},\
         {\"name\":\"Reddy Kill-a-Watt\"}],\"name\":\"mei\",\"species\":\"human\"}"
    );
}

#[mockalloc::test]
fn sparse_overlay_inherits_from_base_dict() {
    let base = encode_person();
    let person = ValueRef::from_bytes(&base).unwrap().as_dict().unwrap();

    let mut mp = MutableDict::from_dict(person);
    mp.set("age", 31);

    let mut enc = Encoder::new();
    enc.set_base(&base);
    enc.reuse_base_strings();
    enc.write_value(mp.as_value());
    let delta = enc.finish();

    // One changed key out of five: the delta stores only the overlay pair
    // plus the parent reference, so it stays much smaller than the base.
    assert!(delta.len() < base.len() / 2);

    let doc = apply_delta(&base, &delta);
    let new_person = ValueRef::from_bytes(&doc).unwrap().as_dict().unwrap();
    assert_eq!(new_person.count(), 5);
    assert_eq!(new_person.get("age").unwrap().as_int(), 31);
    assert_eq!(new_person.get("species").unwrap().as_str(), Some("human"));
    let keys: Vec<&str> = new_person.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, ["age", "city", "friends", "name", "species"]);
}

#[mockalloc::test]
fn removed_key_encodes_as_deletion() {
    let base = encode_person();
    let person = ValueRef::from_bytes(&base).unwrap().as_dict().unwrap();

    let mut mp = MutableDict::from_dict(person);
    mp.remove("species");
    assert_eq!(mp.count(), 4);
    assert!(mp.get("species").is_none());

    let mut enc = Encoder::new();
    enc.set_base(&base);
    enc.reuse_base_strings();
    enc.write_value(mp.as_value());
    let doc = apply_delta(&base, &enc.finish());

    let new_person = ValueRef::from_bytes(&doc).unwrap().as_dict().unwrap();
    assert_eq!(new_person.count(), 4);
    assert!(new_person.get("species").is_none());
    assert!(!new_person.iter().any(|(k, _)| k == "species"));
    assert_eq!(new_person.get("name").unwrap().as_str(), Some("mei"));
}

#[mockalloc::test]
fn remove_all_reencodes_to_empty_dict() {
    let base = encode_name_vehicle();
    let original = ValueRef::from_bytes(&base).unwrap().as_dict().unwrap();

    // removeAll tombstones every source key; the overlay is no longer
    // sparse, so re-encoding materializes a plain empty dict.
    let mut update = MutableDict::from_dict(original);
    update.remove_all();
    assert_eq!(update.count(), 0);
    assert_eq!(update.iter().count(), 0);
    assert!(update.get("Name").is_none());

    let mut enc = Encoder::new();
    enc.set_base(&base);
    enc.write_value(update.as_value());
    let doc = apply_delta(&base, &enc.finish());

    let decoded = ValueRef::from_bytes(&doc).unwrap().as_dict().unwrap();
    assert_eq!(decoded.count(), 0);
    assert!(decoded.get("Name").is_none());
    assert!(decoded.get("Vehicle").is_none());
    assert_eq!(decoded.value().to_json(), "{}");
}

#[mockalloc::test]
fn unchanged_overlay_reencodes_to_same_document() {
    let base = encode_person();
    let person = ValueRef::from_bytes(&base).unwrap().as_dict().unwrap();
    let original_json = person.value().to_json();

    let update = MutableDict::from_dict(person);
    assert!(!update.is_changed());

    let mut enc = Encoder::new();
    enc.set_base(&base);
    enc.write_value(update.as_value());
    let delta = enc.finish();

    let doc = apply_delta(&base, &delta);
    let decoded = ValueRef::from_bytes(&doc).unwrap();
    assert_eq!(decoded.to_json(), original_json);
}

#[mockalloc::test]
fn chained_deltas_materialize_past_one_generation() {
    // First delta: inherited dict over the base.
    let base = encode_person();
    let person = ValueRef::from_bytes(&base).unwrap().as_dict().unwrap();
    let mut mp = MutableDict::from_dict(person);
    mp.set("age", 31);

    let mut enc = Encoder::new();
    enc.set_base(&base);
    enc.write_value(mp.as_value());
    let doc1 = apply_delta(&base, &enc.finish());

    // Second delta: the source is itself inherited, which is still fine.
    let root1 = ValueRef::from_bytes(&doc1).unwrap().as_dict().unwrap();
    let mut mp2 = MutableDict::from_dict(root1);
    mp2.set("city", "Tokorozawa");

    let mut enc = Encoder::new();
    enc.set_base(&doc1);
    enc.write_value(mp2.as_value());
    let doc2 = apply_delta(&doc1, &enc.finish());

    // Third delta: the chain would grow past one generation of
    // base-over-base, so the dict materializes instead.
    let root2 = ValueRef::from_bytes(&doc2).unwrap().as_dict().unwrap();
    let mut mp3 = MutableDict::from_dict(root2);
    mp3.set("name", "granny");

    let mut enc = Encoder::new();
    enc.set_base(&doc2);
    enc.write_value(mp3.as_value());
    let doc3 = apply_delta(&doc2, &enc.finish());

    let decoded = ValueRef::from_bytes(&doc3).unwrap().as_dict().unwrap();
    assert_eq!(decoded.get("age").unwrap().as_int(), 31);
    assert_eq!(decoded.get("city").unwrap().as_str(), Some("Tokorozawa"));
    assert_eq!(decoded.get("name").unwrap().as_str(), Some("granny"));
    assert_eq!(decoded.get("species").unwrap().as_str(), Some("human"));
    assert_eq!(decoded.count(), 5);
}
