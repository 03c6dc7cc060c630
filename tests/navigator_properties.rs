//! Property-style checks on the B-tree navigator (spec.md §8, first two
//! quantified invariants: block validation on load, and parent key/
//! generation agreement with a child).

use std::collections::HashMap;

use fsckctl::btrfs::path::BlockSource;
use fsckctl::btrfs::path::Path;
use fsckctl::btrfs::treeblock::{Item, KeyPtr, TreeBlock};
use fsckctl::btrfs::types::Key;
use fsckctl::error::FsckError;

struct MapSource(HashMap<u64, TreeBlock>);

impl BlockSource for MapSource {
    fn read_block(
        &mut self,
        bytenr: u64,
        _expected_generation: Option<u64>,
    ) -> Result<TreeBlock, FsckError> {
        self.0
            .get(&bytenr)
            .cloned()
            .ok_or(FsckError::Parse("no such block"))
    }
}

fn leaf(bytenr: u64, keys: &[u64]) -> TreeBlock {
    TreeBlock {
        bytenr,
        generation: 7,
        owner: 5,
        level: 0,
        key_ptrs: Vec::new(),
        items: keys
            .iter()
            .map(|&objectid| Item {
                key: Key::new(objectid, 1, 0),
                data: vec![],
            })
            .collect(),
    }
}

fn three_leaf_tree() -> (MapSource, u64) {
    let a = leaf(100, &[1, 2, 3]);
    let b = leaf(200, &[4, 5, 6]);
    let c = leaf(300, &[7, 8, 9]);
    let root = TreeBlock {
        bytenr: 10,
        generation: 8,
        owner: 5,
        level: 1,
        key_ptrs: vec![
            KeyPtr { key: Key::new(1, 1, 0), blockptr: 100, generation: 7 },
            KeyPtr { key: Key::new(4, 1, 0), blockptr: 200, generation: 7 },
            KeyPtr { key: Key::new(7, 1, 0), blockptr: 300, generation: 7 },
        ],
        items: Vec::new(),
    };
    let mut map = HashMap::new();
    map.insert(10, root);
    map.insert(100, a);
    map.insert(200, b);
    map.insert(300, c);
    (MapSource(map), 10)
}

#[test]
fn walking_the_whole_tree_visits_keys_in_strictly_increasing_order() {
    let (mut source, root) = three_leaf_tree();
    let (mut path, exact) = Path::search_slot(&mut source, root, Key::new(0, 1, 0)).unwrap();
    assert!(!exact);

    let mut seen = Vec::new();
    loop {
        if let Some(key) = path.current_key() {
            seen.push(key);
        }
        if !path.next_slot(&mut source).unwrap() {
            break;
        }
    }

    assert_eq!(seen.len(), 9);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn walking_backward_from_the_end_visits_the_same_keys_reversed() {
    let (mut source, root) = three_leaf_tree();
    let (mut path, exact) = Path::search_slot(&mut source, root, Key::new(9, 1, 0)).unwrap();
    assert!(exact);

    let mut forward = vec![path.current_key().unwrap()];
    let mut backward_path = path;
    let mut backward = Vec::new();
    while backward_path.prev_slot(&mut source).unwrap() {
        backward.push(backward_path.current_key().unwrap());
    }
    backward.reverse();
    backward.push(forward.pop().unwrap());
    assert_eq!(backward, vec![
        Key::new(1, 1, 0), Key::new(2, 1, 0), Key::new(3, 1, 0),
        Key::new(4, 1, 0), Key::new(5, 1, 0), Key::new(6, 1, 0),
        Key::new(7, 1, 0), Key::new(8, 1, 0), Key::new(9, 1, 0),
    ]);
}

#[test]
fn each_child_blocks_generation_matches_its_parent_key_pointer() {
    let (mut source, root_bytenr) = three_leaf_tree();
    let root = source.read_block(root_bytenr, None).unwrap();
    for kp in &root.key_ptrs {
        let child = source.read_block(kp.blockptr, Some(kp.generation)).unwrap();
        child.validate_generation(kp.generation).expect("generation must agree");
        assert_eq!(child.first_key(), Some(kp.key));
    }
}

#[test]
fn validate_rejects_a_block_read_at_the_wrong_address() {
    let block = leaf(100, &[1, 2, 3]);
    assert!(block.validate(100).is_ok());
    assert!(block.validate(999).is_err());
}

#[test]
fn validate_rejects_non_increasing_keys() {
    let mut block = leaf(100, &[1, 2, 3]);
    block.items[1].key = Key::new(1, 1, 0);
    assert!(block.validate(100).is_err());
}
