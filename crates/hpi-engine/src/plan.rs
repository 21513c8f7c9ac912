//! Planning of the distributed environment of a job.
//!
//! The planner fixes everything about the topology that can be known before
//! the job is allocated: the rendezvous port, the world size and the rank
//! range owned by each node. The rendezvous host is not known until Slurm
//! allocates nodes, so the plan carries a shell expression that resolves it on
//! the allocated nodes at job start.

use std::ops::Range;

use indexmap::IndexMap;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::config::PortRange;
use crate::env::EnvValue;
use crate::spec::ValidJobSpec;

/// Resolves the hostname of the first allocated node.
pub const FIRST_NODE_EXPR: &str = r#"$(scontrol show hostnames "$SLURM_JOB_NODELIST" | head -n 1)"#;

/// The rendezvous host variable.
pub const MASTER_ADDR: &str = "MASTER_ADDR";

/// The rendezvous port variable.
pub const MASTER_PORT: &str = "MASTER_PORT";

/// The node rank variable.
pub const NODE_RANK: &str = "NODE_RANK";

/// The global process rank variable.
pub const RANK: &str = "RANK";

/// The node-local process rank variable.
pub const LOCAL_RANK: &str = "LOCAL_RANK";

/// The world size variable.
pub const WORLD_SIZE: &str = "WORLD_SIZE";

/// The variables owned by the distributed plan.
///
/// User-supplied values for these keys are always overridden.
pub const RESERVED_ENV_VARS: &[&str] = &[
    MASTER_ADDR,
    MASTER_PORT,
    NODE_RANK,
    RANK,
    LOCAL_RANK,
    WORLD_SIZE,
];

/// Represents the distributed topology of one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedPlan {
    /// The rendezvous host, as an expression evaluated on the allocation.
    rendezvous_host: String,
    /// The rendezvous port.
    rendezvous_port: u16,
    /// The total number of processes.
    world_size: u64,
    /// The range of global ranks owned by each node, by node index.
    node_ranks: Vec<Range<u64>>,
}

impl DistributedPlan {
    /// Gets the rendezvous host expression.
    pub fn rendezvous_host(&self) -> &str {
        &self.rendezvous_host
    }

    /// Gets the rendezvous port.
    pub fn rendezvous_port(&self) -> u16 {
        self.rendezvous_port
    }

    /// Gets the total number of processes.
    pub fn world_size(&self) -> u64 {
        self.world_size
    }

    /// Gets the rank ranges of every node, indexed by node.
    pub fn node_ranks(&self) -> &[Range<u64>] {
        &self.node_ranks
    }

    /// Gets the rank range of the given node.
    pub fn ranks_of(&self, node: usize) -> Option<Range<u64>> {
        self.node_ranks.get(node).cloned()
    }

    /// Gets the environment variables describing this plan.
    ///
    /// The rank variables are evaluated per launched process from the ids
    /// Slurm assigns; with a block distribution `SLURM_PROCID` equals the
    /// planned rank.
    pub fn environment(&self) -> IndexMap<String, EnvValue> {
        [
            (
                MASTER_ADDR,
                EnvValue::JobExpr(self.rendezvous_host.clone()),
            ),
            (
                MASTER_PORT,
                EnvValue::literal(self.rendezvous_port.to_string()),
            ),
            (WORLD_SIZE, EnvValue::literal(self.world_size.to_string())),
            (NODE_RANK, EnvValue::TaskExpr("$SLURM_NODEID".to_string())),
            (RANK, EnvValue::TaskExpr("$SLURM_PROCID".to_string())),
            (LOCAL_RANK, EnvValue::TaskExpr("$SLURM_LOCALID".to_string())),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// Computes distributed plans.
#[derive(Debug, Clone, Copy)]
pub struct Planner {
    /// The range the rendezvous port is drawn from.
    ports: PortRange,
}

impl Planner {
    /// Creates a planner drawing ports from the given range.
    pub fn new(ports: PortRange) -> Self {
        Self { ports }
    }

    /// Plans the distributed environment of a job.
    ///
    /// The port is drawn once per call so every node of the job agrees on it.
    pub fn plan<R: Rng>(&self, spec: &ValidJobSpec, rng: &mut R) -> DistributedPlan {
        let per_node = u64::from(spec.processes_per_node);
        let node_ranks = (0..u64::from(spec.num_nodes))
            .map(|node| node * per_node..(node + 1) * per_node)
            .collect();

        DistributedPlan {
            rendezvous_host: FIRST_NODE_EXPR.to_string(),
            rendezvous_port: rng.random_range(self.ports.to_range()),
            world_size: spec.world_size(),
            node_ranks,
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::spec::JobSpec;

    fn valid(nodes: u32, per_node: u32) -> ValidJobSpec {
        let mut spec = JobSpec::new("plan", "test", "01:00:00");
        spec.num_nodes = nodes;
        spec.processes_per_node = per_node;
        spec.shared_storage_root = Some(PathBuf::from("/shared"));
        ValidJobSpec::new(spec).unwrap()
    }

    #[test]
    fn rank_ranges_cover_the_world_exactly() {
        let planner = Planner::new(PortRange::default());
        let mut rng = StdRng::seed_from_u64(7);
        for nodes in 1..=6 {
            for per_node in 1..=5 {
                let plan = planner.plan(&valid(nodes, per_node), &mut rng);
                assert_eq!(plan.world_size(), u64::from(nodes * per_node));
                assert_eq!(plan.node_ranks().len(), nodes as usize);

                let mut next = 0;
                for range in plan.node_ranks() {
                    assert_eq!(range.start, next, "gap or overlap in {plan:?}");
                    assert_eq!(range.end - range.start, u64::from(per_node));
                    next = range.end;
                }
                assert_eq!(next, plan.world_size());
            }
        }
    }

    #[test]
    fn single_node_single_process() {
        let plan = Planner::new(PortRange::default())
            .plan(&valid(1, 1), &mut StdRng::seed_from_u64(1));
        assert_eq!(plan.world_size(), 1);
        assert_eq!(plan.ranks_of(0), Some(0..1));
        assert_eq!(plan.ranks_of(1), None);

        // Distributed variables are exported even for a single node.
        let env = plan.environment();
        for key in RESERVED_ENV_VARS {
            assert!(env.contains_key(*key), "missing `{key}`");
        }
        assert_eq!(env[WORLD_SIZE].as_literal(), Some("1"));
    }

    #[test]
    fn port_is_drawn_from_the_range() {
        let planner = Planner::new(PortRange::default());
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let port = planner.plan(&valid(2, 1), &mut rng).rendezvous_port();
            assert!((30000..=50000).contains(&port));
        }

        let narrow = Planner::new(PortRange {
            min: 40000,
            max: 40000,
        });
        assert_eq!(narrow.plan(&valid(1, 1), &mut rng).rendezvous_port(), 40000);
    }

    #[test]
    fn host_is_late_bound() {
        let plan = Planner::new(PortRange::default())
            .plan(&valid(3, 2), &mut StdRng::seed_from_u64(3));
        assert_eq!(plan.rendezvous_host(), FIRST_NODE_EXPR);
        assert_eq!(
            plan.environment()[MASTER_ADDR],
            EnvValue::JobExpr(FIRST_NODE_EXPR.to_string())
        );
        assert_eq!(plan.ranks_of(2), Some(4..6));
    }
}
