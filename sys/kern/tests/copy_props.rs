// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property tests for the vectored copy: however both sides fragment their
//! buffers, the receiver gets exactly the prefix of the source bytes that
//! fits, laid out in order.

use abi::IoVec;
use kern::umem::{copy_vectored, total_len, MemAccess, VecDesc};
use kern::vm::AccessRights;
use proptest::prelude::*;

struct Open;

impl MemAccess for Open {
    fn can_access(&self, _: usize, _: usize, _: AccessRights) -> bool {
        true
    }
}

/// Splits `buf` into fragments with the given lengths; whatever the
/// lengths don't cover becomes one final fragment.
fn fragment(buf: &[u8], lens: &[usize]) -> Vec<IoVec> {
    let mut iovs = Vec::new();
    let mut off = 0;
    for &l in lens {
        if off >= buf.len() {
            break;
        }
        let l = l.min(buf.len() - off);
        iovs.push(IoVec {
            base: buf.as_ptr() as usize + off,
            len: l,
        });
        off += l;
    }
    if off < buf.len() {
        iovs.push(IoVec {
            base: buf.as_ptr() as usize + off,
            len: buf.len() - off,
        });
    }
    if iovs.is_empty() {
        // An empty source is a vector of zero fragments.
        iovs.push(IoVec {
            base: buf.as_ptr() as usize,
            len: 0,
        });
    }
    iovs
}

proptest! {
    #[test]
    fn prefix_law_holds_for_any_partition(
        data in proptest::collection::vec(any::<u8>(), 0..128),
        src_lens in proptest::collection::vec(1usize..32, 0..8),
        dst_lens in proptest::collection::vec(0usize..24, 1..8),
        skip in 0usize..160,
    ) {
        let src_iovs = fragment(&data, &src_lens);

        let dst_total: usize = dst_lens.iter().sum();
        let mut dst = vec![0xAAu8; dst_total.max(1)];
        let dst_base = dst.as_mut_ptr() as usize;
        let mut dst_iovs = Vec::new();
        let mut off = 0;
        for &l in &dst_lens {
            dst_iovs.push(IoVec {
                base: dst_base + off,
                len: l,
            });
            off += l;
        }

        let n = copy_vectored(
            &Open,
            VecDesc::User {
                base: src_iovs.as_ptr() as usize,
                count: src_iovs.len(),
            },
            skip,
            &Open,
            VecDesc::User {
                base: dst_iovs.as_ptr() as usize,
                count: dst_iovs.len(),
            },
        )
        .unwrap();

        let start = skip.min(data.len());
        let expect = &data[start..][..(data.len() - start).min(dst_total)];
        prop_assert_eq!(n, expect.len());

        // The destination concatenation holds exactly the prefix, and the
        // slack beyond it is untouched.
        prop_assert_eq!(&dst[..n], expect);
        prop_assert!(dst[n..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn total_len_sums_any_partition(
        data in proptest::collection::vec(any::<u8>(), 0..128),
        src_lens in proptest::collection::vec(1usize..32, 0..8),
    ) {
        let src_iovs = fragment(&data, &src_lens);
        let total = total_len(
            &Open,
            VecDesc::User {
                base: src_iovs.as_ptr() as usize,
                count: src_iovs.len(),
            },
        )
        .unwrap();
        prop_assert_eq!(total, data.len());
    }
}
