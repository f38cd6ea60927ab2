/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

// Jenkins Wiki: https://en.wikipedia.org/wiki/Jenkins_hash_function
// 64bit variant: http://burtleburtle.net/bob/hash/integer.html

pub fn jenkins64(mut hash: u64) -> u64 {
    hash = hash
        .overflowing_shl(21)
        .0
        .overflowing_sub(hash)
        .0
        .overflowing_sub(1)
        .0;
    hash = hash ^ hash.overflowing_shr(24).0;
    hash = hash
        .overflowing_add(hash.overflowing_shl(3).0)
        .0
        .overflowing_add(hash.overflowing_shl(8).0)
        .0;
    hash = hash ^ hash.overflowing_shr(14).0;
    hash = hash
        .overflowing_add(hash.overflowing_shl(2).0)
        .0
        .overflowing_add(hash.overflowing_shl(4).0)
        .0;
    hash = hash ^ hash.overflowing_shr(28).0;
    hash = hash.overflowing_add(hash.overflowing_shl(31).0).0;

    hash
}

// Flow keys are compared as 32-bit hashes externally (capture file keying),
// fold the mixed value instead of truncating so both halves contribute.
pub fn jenkins64_fold32(hash: u64) -> u32 {
    let hash = jenkins64(hash);
    (hash ^ hash.overflowing_shr(32).0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_jenkins64() {
        assert_eq!(
            jenkins64(1281291242888) ^ jenkins64(122345676892),
            17281198411619148719
        );
    }

    #[test]
    fn fold_differs_from_truncate() {
        let h = jenkins64(0xdeadbeef);
        assert_eq!(jenkins64_fold32(0xdeadbeef), (h ^ (h >> 32)) as u32);
        assert_ne!(jenkins64_fold32(1), jenkins64_fold32(2));
    }
}
