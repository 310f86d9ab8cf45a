// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Model-based properties: any serialized sequence of operations must leave
//! the bitmap equal to the same sequence applied to a plain `Vec<bool>`.

use concurrent_bitmap::ConcurrentBitmap;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Set(usize),
    Clear(usize),
    Insert { index: usize, value: bool, grow: bool },
    Remove { index: usize, shrink: bool },
    Grow(usize),
    Shrink(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0_usize..256).prop_map(Op::Set),
        (0_usize..256).prop_map(Op::Clear),
        ((0_usize..256), any::<bool>(), any::<bool>())
            .prop_map(|(index, value, grow)| Op::Insert { index, value, grow }),
        ((0_usize..256), any::<bool>()).prop_map(|(index, shrink)| Op::Remove { index, shrink }),
        (0_usize..64).prop_map(Op::Grow),
        (0_usize..64).prop_map(Op::Shrink),
    ]
}

fn apply_model(model: &mut Vec<bool>, op: &Op) {
    match *op {
        Op::Set(index) => {
            if index < model.len() {
                model[index] = true;
            }
        }
        Op::Clear(index) => {
            if index < model.len() {
                model[index] = false;
            }
        }
        Op::Insert { index, value, grow } => {
            if grow {
                if index <= model.len() {
                    model.insert(index, value);
                }
            } else if index < model.len() {
                model.insert(index, value);
                model.pop();
            }
        }
        Op::Remove { index, shrink } => {
            if index < model.len() {
                model.remove(index);
                if !shrink {
                    model.push(false);
                }
            }
        }
        Op::Grow(by) => model.extend(std::iter::repeat_n(false, by)),
        Op::Shrink(by) => {
            if by <= model.len() {
                model.truncate(model.len() - by);
            }
        }
    }
}

fn apply_map(map: &ConcurrentBitmap, op: &Op) {
    // out-of-range operations are expected to fail; the model ignores them
    match *op {
        Op::Set(index) => drop(map.update_bit(index, true)),
        Op::Clear(index) => drop(map.update_bit(index, false)),
        Op::Insert { index, value, grow } => drop(map.insert_bit_at(index, value, grow)),
        Op::Remove { index, shrink } => drop(map.remove_bit_at(index, shrink)),
        Op::Grow(by) => map.grow(by),
        Op::Shrink(by) => drop(map.shrink(by)),
    }
}

proptest! {
    #[test]
    fn matches_vec_model(len in 0_usize..200, ops in prop::collection::vec(op_strategy(), 0..40)) {
        let map = ConcurrentBitmap::new(len);
        let mut model = vec![false; len];

        for op in &ops {
            apply_map(&map, op);
            apply_model(&mut model, op);

            prop_assert_eq!(map.len(), model.len());
        }

        let bits: Vec<bool> = (0..model.len()).map(|i| map.is_bit_set(i).unwrap()).collect();
        prop_assert_eq!(&bits, &model);

        let pop = model.iter().filter(|&&b| b).count();
        prop_assert_eq!(map.unsafe_pop_count(), pop);
        prop_assert_eq!(map.is_empty(), pop == 0);
        prop_assert_eq!(map.is_full(), pop == model.len());
        prop_assert_eq!(map.find_first_set(), model.iter().position(|&b| b));
    }

    #[test]
    fn tokens_detect_any_interleaved_mutation(index in 0_usize..56, writes in 1_usize..8) {
        let map = ConcurrentBitmap::new(56);
        let token = map.get_token(index).unwrap();

        for i in 0..writes {
            map.update_bit((index + i) % 56, true).unwrap();
        }

        // any committed mutation of the segment invalidates the token
        prop_assert!(!map.try_update_bit(index, token, false).unwrap());

        let fresh = map.get_token(index).unwrap();
        prop_assert!(map.try_update_bit(index, fresh, false).unwrap());
    }
}
