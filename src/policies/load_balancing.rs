use std::{
    collections::HashSet,
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use rand::seq::SliceRandom;

use crate::cluster::{ClusterSnapshot, Host, HostDistance, Token};
use crate::options::EndPoint;

/// The ordered, single-pass sequence of candidate coordinators for one request.
pub type QueryPlan = Box<dyn Iterator<Item = Arc<Host>> + Send>;

/// What a load balancing policy may inspect about the request being planned.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct RequestInfo {
    /// The keyspace the request runs against, if known.
    pub keyspace: Option<String>,
    /// The token derived from the routing key, when the statement carries one.
    pub token: Option<Token>,
}

/// Orders candidate hosts for each request and classifies every host's distance,
/// which in turn sizes its connection pool.
pub trait LoadBalancingPolicy: Send + Sync + Debug {
    /// The authoritative distance of a host.
    fn distance(&self, host: &Host) -> HostDistance;

    /// A fresh query plan. Plans are lazy and not restartable.
    fn new_query_plan(&self, request: &RequestInfo, cluster: &ClusterSnapshot) -> QueryPlan;
}

/// Cycles through all UP hosts, starting each plan one position later than the
/// previous one.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    /// Creates the policy.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn new_query_plan(&self, _request: &RequestInfo, cluster: &ClusterSnapshot) -> QueryPlan {
        let hosts = cluster.hosts().to_vec();
        if hosts.is_empty() {
            return Box::new(std::iter::empty());
        }
        let offset = self.index.fetch_add(1, Ordering::Relaxed) % hosts.len();
        let rotated = hosts[offset..]
            .to_vec()
            .into_iter()
            .chain(hosts[..offset].to_vec());
        // Liveness is checked lazily, when the plan reaches the host.
        Box::new(rotated.filter(|host| host.is_up()))
    }
}

/// Prefers hosts in the configured local datacenter, round-robin among them. Remote
/// hosts are appended to plans only when explicitly permitted.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    allow_remote: bool,
    index: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    /// Creates a policy that only ever queries `local_dc`.
    pub fn new(local_dc: impl Into<String>) -> Self {
        Self {
            local_dc: local_dc.into(),
            allow_remote: false,
            index: AtomicUsize::new(0),
        }
    }

    /// Also appends remote-datacenter hosts at the end of each plan.
    pub fn with_remote_fallback(local_dc: impl Into<String>) -> Self {
        Self {
            local_dc: local_dc.into(),
            allow_remote: true,
            index: AtomicUsize::new(0),
        }
    }

    fn is_local(&self, host: &Host) -> bool {
        host.datacenter().as_deref() == Some(self.local_dc.as_str())
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn distance(&self, host: &Host) -> HostDistance {
        if self.is_local(host) {
            HostDistance::Local
        } else {
            HostDistance::Remote
        }
    }

    fn new_query_plan(&self, _request: &RequestInfo, cluster: &ClusterSnapshot) -> QueryPlan {
        let local: Vec<_> = cluster
            .hosts()
            .iter()
            .filter(|h| self.is_local(h))
            .cloned()
            .collect();

        let offset = if local.is_empty() {
            0
        } else {
            self.index.fetch_add(1, Ordering::Relaxed) % local.len()
        };
        let rotated_local = local[offset..]
            .to_vec()
            .into_iter()
            .chain(local[..offset].to_vec());

        let remote: Vec<_> = if self.allow_remote {
            cluster
                .hosts()
                .iter()
                .filter(|h| !self.is_local(h))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        Box::new(rotated_local.chain(remote).filter(|host| host.is_up()))
    }
}

/// Yields the replicas owning the request's token first (shuffled, so one replica is
/// not hammered), then falls back to the child policy's plan.
#[derive(Debug)]
pub struct TokenAwarePolicy {
    child: Arc<dyn LoadBalancingPolicy>,
}

impl TokenAwarePolicy {
    /// Wraps a child policy.
    pub fn new(child: Arc<dyn LoadBalancingPolicy>) -> Self {
        Self { child }
    }
}

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn distance(&self, host: &Host) -> HostDistance {
        self.child.distance(host)
    }

    fn new_query_plan(&self, request: &RequestInfo, cluster: &ClusterSnapshot) -> QueryPlan {
        let Some(token) = request.token else {
            return self.child.new_query_plan(request, cluster);
        };

        let mut replicas: Vec<Arc<Host>> = cluster
            .replicas(token)
            .into_iter()
            .filter(|host| {
                host.is_up() && self.child.distance(host) != HostDistance::Ignored
            })
            .collect();

        // Shuffle within each distance band, keeping local replicas ahead of remote
        // ones.
        let mut rng = rand::rng();
        replicas.sort_by_key(|host| match self.child.distance(host) {
            HostDistance::Local => 0,
            HostDistance::Remote => 1,
            HostDistance::Ignored => 2,
        });
        let local_count = replicas
            .iter()
            .take_while(|h| self.child.distance(h) == HostDistance::Local)
            .count();
        replicas[..local_count].shuffle(&mut rng);
        replicas[local_count..].shuffle(&mut rng);

        let yielded: HashSet<EndPoint> =
            replicas.iter().map(|h| h.endpoint().clone()).collect();
        let rest = self
            .child
            .new_query_plan(request, cluster)
            .filter(move |host| !yielded.contains(host.endpoint()));

        Box::new(replicas.into_iter().chain(rest))
    }
}

/// Restricts both plans and distances to an explicit set of hosts; everything else is
/// ignored and holds no connections.
#[derive(Debug)]
pub struct AllowListPolicy {
    child: Arc<dyn LoadBalancingPolicy>,
    allowed: HashSet<EndPoint>,
}

impl AllowListPolicy {
    /// Wraps a child policy with an endpoint allow list.
    pub fn new(child: Arc<dyn LoadBalancingPolicy>, allowed: impl IntoIterator<Item = EndPoint>) -> Self {
        Self {
            child,
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl LoadBalancingPolicy for AllowListPolicy {
    fn distance(&self, host: &Host) -> HostDistance {
        if self.allowed.contains(host.endpoint()) {
            self.child.distance(host)
        } else {
            HostDistance::Ignored
        }
    }

    fn new_query_plan(&self, request: &RequestInfo, cluster: &ClusterSnapshot) -> QueryPlan {
        let allowed = self.allowed.clone();
        Box::new(
            self.child
                .new_query_plan(request, cluster)
                .filter(move |host| allowed.contains(host.endpoint())),
        )
    }
}

/// The default policy: token-aware routing over datacenter-aware round-robin (or
/// plain round-robin when no local datacenter is configured).
#[derive(Debug)]
pub struct DefaultLoadBalancingPolicy {
    inner: TokenAwarePolicy,
}

impl DefaultLoadBalancingPolicy {
    /// Creates the default policy, optionally pinned to a local datacenter.
    pub fn new(local_dc: Option<String>) -> Self {
        let child: Arc<dyn LoadBalancingPolicy> = match local_dc {
            Some(dc) => Arc::new(DcAwareRoundRobinPolicy::new(dc)),
            None => Arc::new(RoundRobinPolicy::new()),
        };
        Self {
            inner: TokenAwarePolicy::new(child),
        }
    }
}

impl LoadBalancingPolicy for DefaultLoadBalancingPolicy {
    fn distance(&self, host: &Host) -> HostDistance {
        self.inner.distance(host)
    }

    fn new_query_plan(&self, request: &RequestInfo, cluster: &ClusterSnapshot) -> QueryPlan {
        self.inner.new_query_plan(request, cluster)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::test_util::{host_in_dc, snapshot_of};

    fn plan_hosts(plan: QueryPlan) -> Vec<String> {
        plan.map(|h| h.endpoint().host.clone()).collect()
    }

    #[test]
    fn round_robin_rotates_first_position() {
        let hosts = vec![
            host_in_dc("a", "dc1", true),
            host_in_dc("b", "dc1", true),
            host_in_dc("c", "dc1", true),
        ];
        let snapshot = snapshot_of(hosts);
        let policy = RoundRobinPolicy::new();

        let mut first_position_counts = std::collections::HashMap::new();
        for _ in 0..9 {
            let plan = plan_hosts(policy.new_query_plan(&RequestInfo::default(), &snapshot));
            assert_eq!(plan.len(), 3);
            *first_position_counts.entry(plan[0].clone()).or_insert(0) += 1;
        }
        // Over 9 plans of 3 hosts, every host leads exactly 3 times.
        for name in ["a", "b", "c"] {
            assert_eq!(first_position_counts[name], 3);
        }
    }

    #[test]
    fn round_robin_skips_down_hosts() {
        let hosts = vec![
            host_in_dc("a", "dc1", true),
            host_in_dc("b", "dc1", false),
            host_in_dc("c", "dc1", true),
        ];
        let snapshot = snapshot_of(hosts);
        let policy = RoundRobinPolicy::new();
        let plan = plan_hosts(policy.new_query_plan(&RequestInfo::default(), &snapshot));
        assert!(!plan.contains(&"b".to_string()));
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn dc_aware_classifies_by_datacenter() {
        let local = host_in_dc("a", "dc1", true);
        let remote = host_in_dc("b", "dc2", true);
        let policy = DcAwareRoundRobinPolicy::new("dc1");
        assert_eq!(policy.distance(&local), HostDistance::Local);
        assert_eq!(policy.distance(&remote), HostDistance::Remote);
    }

    #[test]
    fn dc_aware_skips_remote_unless_permitted() {
        let hosts = vec![
            host_in_dc("a", "dc1", true),
            host_in_dc("b", "dc2", true),
            host_in_dc("c", "dc1", true),
        ];
        let snapshot = snapshot_of(hosts);

        let strict = DcAwareRoundRobinPolicy::new("dc1");
        let plan = plan_hosts(strict.new_query_plan(&RequestInfo::default(), &snapshot));
        assert!(!plan.contains(&"b".to_string()));

        let permissive = DcAwareRoundRobinPolicy::with_remote_fallback("dc1");
        let plan = plan_hosts(permissive.new_query_plan(&RequestInfo::default(), &snapshot));
        assert_eq!(plan.last(), Some(&"b".to_string()));
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn allow_list_ignores_everything_else() {
        let inside = host_in_dc("a", "dc1", true);
        let outside = host_in_dc("b", "dc1", true);
        let policy = AllowListPolicy::new(
            Arc::new(RoundRobinPolicy::new()),
            [inside.endpoint().clone()],
        );
        assert_eq!(policy.distance(&inside), HostDistance::Local);
        assert_eq!(policy.distance(&outside), HostDistance::Ignored);

        let snapshot = snapshot_of(vec![inside, outside]);
        let plan = plan_hosts(policy.new_query_plan(&RequestInfo::default(), &snapshot));
        assert_eq!(plan, vec!["a".to_string()]);
    }

    #[test]
    fn token_aware_yields_a_replica_first() {
        use crate::cluster::{test_util::snapshot_with_ring, HostMetadata};

        let make = |name: &str, token: i64| {
            let host = crate::cluster::test_util::host_with_metadata(
                name,
                HostMetadata {
                    datacenter: Some("dc1".to_string()),
                    tokens: vec![token],
                    ..Default::default()
                },
            );
            host.set_up(true);
            host
        };
        let hosts = vec![make("a", 0), make("b", 100), make("c", 200)];
        let snapshot = snapshot_with_ring(hosts, 1);

        let policy = TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new()));
        let request = RequestInfo {
            token: Some(Token(150)),
            ..Default::default()
        };
        for _ in 0..5 {
            let plan = plan_hosts(policy.new_query_plan(&request, &snapshot));
            // Token 150 falls to the ring successor, c; the rest of the plan covers
            // the other hosts exactly once.
            assert_eq!(plan[0], "c");
            assert_eq!(plan.len(), 3);
        }
    }

    #[test]
    fn token_aware_without_token_delegates() {
        let hosts = vec![host_in_dc("a", "dc1", true), host_in_dc("b", "dc1", true)];
        let snapshot = snapshot_of(hosts);
        let policy = TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new()));
        let plan = plan_hosts(policy.new_query_plan(&RequestInfo::default(), &snapshot));
        assert_eq!(plan.len(), 2);
    }
}
