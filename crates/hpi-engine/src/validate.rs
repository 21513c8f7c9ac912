//! Validation of job specifications.

use crate::error::ConfigError;
use crate::spec::JobSpec;
use crate::spec::Walltime;

/// Validates a job specification.
///
/// Checks run in a fixed order and the first failure is returned:
///
/// 1. node and process counts are positive;
/// 2. the wall-time parses to a positive duration;
/// 3. the partition is non-empty;
/// 4. every container mount is exactly one `host:container` pair;
/// 5. a multi-node job has a shared storage root;
/// 6. the job name is usable as a directory and Slurm job name;
/// 7. every extra environment variable name is a valid shell identifier.
pub fn validate(spec: &JobSpec) -> Result<(), ConfigError> {
    let job = || spec.job_name.clone();

    if spec.num_nodes == 0 {
        return Err(ConfigError::InvalidNodeCount { job: job() });
    }
    if spec.processes_per_node == 0 {
        return Err(ConfigError::InvalidProcessCount { job: job() });
    }

    if let Err(reason) = spec.walltime.parse::<Walltime>() {
        return Err(ConfigError::InvalidWalltime {
            job: job(),
            value: spec.walltime.clone(),
            reason,
        });
    }

    if spec.partition.trim().is_empty() {
        return Err(ConfigError::EmptyPartition { job: job() });
    }

    if let Some(container) = &spec.container
        && let Some(mount) = container.mounts.iter().find(|m| !is_mount_pair(m))
    {
        return Err(ConfigError::InvalidMount {
            job: job(),
            mount: mount.clone(),
        });
    }

    if spec.is_multi_node() && spec.shared_storage_root.is_none() {
        return Err(ConfigError::MissingSharedStorageRoot {
            job: job(),
            nodes: spec.num_nodes,
        });
    }

    if spec.job_name.is_empty()
        || spec
            .job_name
            .chars()
            .any(|c| c.is_whitespace() || c == '/')
    {
        return Err(ConfigError::InvalidJobName { job: job() });
    }

    if let Some(key) = spec.env_vars.keys().find(|k| !is_env_name(k)) {
        return Err(ConfigError::InvalidEnvVar {
            job: job(),
            key: key.clone(),
        });
    }

    Ok(())
}

/// Whether the string can be exported as a shell variable.
fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Whether the mount string is exactly two non-empty paths separated by `:`.
fn is_mount_pair(mount: &str) -> bool {
    let mut parts = mount.split(':');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(host), Some(guest), None) if !host.trim().is_empty() && !guest.trim().is_empty()
    )
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::spec::ContainerSpec;

    fn spec() -> JobSpec {
        JobSpec::new("test-job", "test", "00:30:00")
    }

    #[test]
    fn single_node_gpu_job_is_valid() {
        let mut spec = spec();
        spec.gpus_per_node = 2;
        spec.walltime = "01:00:00".to_string();
        assert_eq!(validate(&spec), Ok(()));
    }

    #[test]
    fn counts_must_be_positive() {
        let mut s = spec();
        s.num_nodes = 0;
        assert!(matches!(
            validate(&s),
            Err(ConfigError::InvalidNodeCount { .. })
        ));

        let mut s = spec();
        s.processes_per_node = 0;
        assert!(matches!(
            validate(&s),
            Err(ConfigError::InvalidProcessCount { .. })
        ));
    }

    #[test]
    fn checks_are_fail_fast_in_order() {
        // Both the wall-time and the partition are wrong; the wall-time is
        // checked first.
        let mut s = spec();
        s.walltime = "soon".to_string();
        s.partition = String::new();
        let err = validate(&s).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWalltime { .. }));
        assert!(err.to_string().contains("test-job"));

        s.walltime = "00:10:00".to_string();
        assert_eq!(
            validate(&s),
            Err(ConfigError::EmptyPartition {
                job: "test-job".to_string()
            })
        );
    }

    #[test]
    fn mounts_must_be_pairs() {
        for bad in ["/data", "/a:/b:/c", ":/b", "/a:", ""] {
            let mut s = spec();
            let mut container = ContainerSpec::new("img");
            container.mounts.push("/ok:/ok".to_string());
            container.mounts.push(bad.to_string());
            s.container = Some(container);
            assert_eq!(
                validate(&s),
                Err(ConfigError::InvalidMount {
                    job: "test-job".to_string(),
                    mount: bad.to_string()
                }),
                "mount `{bad}`"
            );
        }
    }

    #[test]
    fn multi_node_requires_shared_storage() {
        let mut s = spec();
        s.num_nodes = 4;
        s.processes_per_node = 1;
        let err = validate(&s).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingSharedStorageRoot {
                job: "test-job".to_string(),
                nodes: 4
            }
        );
        assert!(err.to_string().contains("shared_storage_root"));

        s.shared_storage_root = Some(PathBuf::from("/shared"));
        assert_eq!(validate(&s), Ok(()));
    }

    #[test]
    fn job_name_must_be_a_path_component() {
        for bad in ["", "my job", "a/b"] {
            let mut s = spec();
            s.job_name = bad.to_string();
            assert!(matches!(
                validate(&s),
                Err(ConfigError::InvalidJobName { .. })
            ));
        }
    }

    #[test]
    fn env_var_names_must_be_identifiers() {
        let mut s = spec();
        s.env_vars.insert("GOOD_1".to_string(), "x".to_string());
        assert_eq!(validate(&s), Ok(()));

        s.env_vars.insert("1BAD".to_string(), "x".to_string());
        assert_eq!(
            validate(&s),
            Err(ConfigError::InvalidEnvVar {
                job: "test-job".to_string(),
                key: "1BAD".to_string()
            })
        );
    }
}
