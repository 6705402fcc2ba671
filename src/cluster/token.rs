//! Murmur3 token computation and the token ring used for replica lookup.

use std::sync::Arc;

use super::Host;

/// The partitioner class the driver can compute tokens for.
pub(crate) const MURMUR3_PARTITIONER: &str = "org.apache.cassandra.dht.Murmur3Partitioner";

/// A position on the Murmur3 token ring.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Token(
    /// The token value.
    pub i64,
);

impl Token {
    /// The token of a partition key under the Murmur3 partitioner.
    pub fn from_routing_key(key: &[u8]) -> Token {
        let hash = murmur3_x64_128_h1(key);
        // The partitioner reserves i64::MIN.
        Token(if hash == i64::MIN { i64::MAX } else { hash })
    }
}

/// The first 64 bits of MurmurHash3 x64_128, matching Cassandra's Java
/// implementation: bytes in the tail are sign-extended, and all arithmetic wraps.
fn murmur3_x64_128_h1(data: &[u8]) -> i64 {
    const C1: i64 = 0x87c3_7b91_1142_53d5_u64 as i64;
    const C2: i64 = 0x4cf5_ad43_2745_937f_u64 as i64;

    let nblocks = data.len() / 16;
    let mut h1: i64 = 0;
    let mut h2: i64 = 0;

    let read_block = |offset: usize| -> i64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&data[offset..offset + 8]);
        i64::from_le_bytes(bytes)
    };

    for block in 0..nblocks {
        let mut k1 = read_block(block * 16);
        let mut k2 = read_block(block * 16 + 8);

        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = &data[nblocks * 16..];
    let sign_extended = |i: usize| -> i64 { tail[i] as i8 as i64 };
    let mut k1: i64 = 0;
    let mut k2: i64 = 0;

    if tail.len() > 8 {
        for i in (8..tail.len()).rev() {
            k2 ^= sign_extended(i) << ((i - 8) * 8);
        }
        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        for i in (0..tail.len().min(8)).rev() {
            k1 ^= sign_extended(i) << (i * 8);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as i64;
    h2 ^= data.len() as i64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix(h1);
    h2 = fmix(h2);
    h1 = h1.wrapping_add(h2);
    h1
}

fn fmix(mut k: i64) -> i64 {
    k ^= ((k as u64) >> 33) as i64;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd_u64 as i64);
    k ^= ((k as u64) >> 33) as i64;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53_u64 as i64);
    k ^= ((k as u64) >> 33) as i64;
    k
}

/// The ring of host tokens, used by token-aware routing to find replicas.
#[derive(Debug, Default)]
pub(crate) struct TokenMap {
    /// Sorted by token. A host appears once per token it owns.
    ring: Vec<(i64, Arc<Host>)>,
    replication_factor: usize,
}

impl TokenMap {
    pub(crate) fn build(hosts: &[Arc<Host>], replication_factor: usize) -> Self {
        let mut ring = Vec::new();
        for host in hosts {
            for token in host.tokens() {
                ring.push((token, Arc::clone(host)));
            }
        }
        ring.sort_by_key(|(token, _)| *token);
        Self {
            ring,
            replication_factor,
        }
    }

    /// The distinct hosts replicating `token`, starting at the ring successor.
    pub(crate) fn replicas(&self, token: Token) -> Vec<Arc<Host>> {
        if self.ring.is_empty() {
            return Vec::new();
        }
        let start = self
            .ring
            .partition_point(|(ring_token, _)| *ring_token < token.0);

        let mut replicas: Vec<Arc<Host>> = Vec::with_capacity(self.replication_factor);
        for i in 0..self.ring.len() {
            let (_, host) = &self.ring[(start + i) % self.ring.len()];
            if !replicas
                .iter()
                .any(|r| r.endpoint() == host.endpoint())
            {
                replicas.push(Arc::clone(host));
                if replicas.len() == self.replication_factor {
                    break;
                }
            }
        }
        replicas
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::{host::HostMetadata, test_util::host_with_metadata};

    fn host_with_tokens(name: &str, tokens: Vec<i64>) -> Arc<Host> {
        host_with_metadata(
            name,
            HostMetadata {
                tokens,
                ..Default::default()
            },
        )
    }

    #[test]
    fn replicas_start_at_ring_successor() {
        let a = host_with_tokens("a", vec![0]);
        let b = host_with_tokens("b", vec![100]);
        let c = host_with_tokens("c", vec![200]);
        let map = TokenMap::build(&[a, b, c], 2);

        let replicas = map.replicas(Token(150));
        let names: Vec<_> = replicas.iter().map(|h| h.endpoint().host.clone()).collect();
        assert_eq!(names, vec!["c", "a"]);

        // A token beyond the last ring position wraps to the first.
        let replicas = map.replicas(Token(201));
        let names: Vec<_> = replicas.iter().map(|h| h.endpoint().host.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);

        // An exact ring token is owned by that position.
        let replicas = map.replicas(Token(100));
        assert_eq!(replicas[0].endpoint().host, "b");
    }

    #[test]
    fn replicas_are_distinct_hosts_with_vnodes() {
        let a = host_with_tokens("a", vec![0, 10, 20]);
        let b = host_with_tokens("b", vec![5, 15, 25]);
        let map = TokenMap::build(&[a, b], 2);

        let replicas = map.replicas(Token(1));
        let names: Vec<_> = replicas.iter().map(|h| h.endpoint().host.clone()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn token_hash_is_deterministic_and_spreads() {
        let t1 = Token::from_routing_key(b"user:1");
        let t2 = Token::from_routing_key(b"user:1");
        let t3 = Token::from_routing_key(b"user:2");
        assert_eq!(t1, t2);
        assert_ne!(t1, t3);
        assert_ne!(t1.0, i64::MIN);
    }
}
