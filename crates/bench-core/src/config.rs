//! Process configuration, read once at startup and shared immutably.
//!
//! Every value comes from a key lookup (normally the process environment) so
//! the same code path builds test configurations without touching globals.

use crate::model::{BenchmarkTest, ProfilingOp, ProfilingVariant};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const REMOTE_PRELUDE: &str =
    "killall node 2>/dev/null; killall ipfs 2>/dev/null; source ~/.nvm/nvm.sh && ";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Local,
    Remote,
}

impl Stage {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "" => Ok(Stage::Local),
            "remote" | "production" => Ok(Stage::Remote),
            other => Err(ConfigError::Invalid {
                key: "STAGE",
                message: format!("expected local or remote, got {}", other),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Local => "local",
            Stage::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub api_key: String,
    pub api_key_defaulted: bool,
}

#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl InfluxConfig {
    pub fn base_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct IpfsConfig {
    pub api_url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// SSH coordinates of the benchmark host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
    pub key: PathBuf,
}

/// The resolved benchmark suites, one per execution location.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkCatalog {
    pub local: Vec<BenchmarkTest>,
    pub remote: Vec<BenchmarkTest>,
}

impl BenchmarkCatalog {
    pub fn suite(&self, remote: bool) -> &[BenchmarkTest] {
        if remote {
            &self.remote
        } else {
            &self.local
        }
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarksConfig {
    pub clinic_enabled: bool,
    pub remote: Option<RemoteTarget>,
    pub catalog: BenchmarkCatalog,
    pub cleanup: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub stage: Stage,
    pub out_folder: String,
    pub data_dir: PathBuf,
    pub runs_root: PathBuf,
    pub log_file: PathBuf,
    pub log_level: String,
    pub keep_run_dirs: bool,
    pub command_timeout: Duration,
    pub nightly_hour: u32,
    pub provision_command: String,
    pub server: ServerConfig,
    pub influx: InfluxConfig,
    pub ipfs: IpfsConfig,
    pub benchmarks: BenchmarksConfig,
}

/// A named script plus the arguments it is invoked with.
#[derive(Debug, Clone, Deserialize)]
pub struct TestAbstract {
    pub name: String,
    pub file: String,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    tests: Vec<TestAbstract>,
    #[serde(default)]
    profiling: Option<BTreeMap<ProfilingOp, Vec<String>>>,
}

const DEFAULT_TESTS: &[(&str, &str)] = &[
    ("localTransfer", "local-transfer.js"),
    ("unixFsAdd", "local-add.js"),
    ("unixFsAddTrickle", "local-add.js trickle"),
    ("localExtract", "local-extract.js"),
    ("multiPeerTransfer", "multi-peer-transfer.js"),
    ("addMultiKb", "add-multi-kb.js"),
    ("addMultiKbTrickle", "add-multi-kb.js trickle"),
    ("initializeNodeBrowser", "init-node.browser.js"),
    ("unixFsAddBrowser", "local-add.browser.js"),
    ("addMultiKbBrowser", "add-multi-kb.browser.js"),
    ("unixFsAddGo", "local-add.go.js"),
    ("extractJs2Go", "extract-js2.go.js"),
    ("extractGo2JsWs", "extract-go2.js ws"),
    ("extractJs2GoWs", "extract-js2.go.js ws"),
    ("extractGo2Js", "extract-go2.js"),
    ("peerTransferBrowser", "peer-transfer.browser.js"),
    ("pubsubMessage", "pubsub-message.js"),
];

pub fn default_test_abstracts() -> Vec<TestAbstract> {
    DEFAULT_TESTS
        .iter()
        .map(|(name, file)| TestAbstract {
            name: name.to_string(),
            file: file.to_string(),
        })
        .collect()
}

pub fn default_profiling_file_sets() -> BTreeMap<ProfilingOp, Vec<String>> {
    let mut sets = BTreeMap::new();
    sets.insert(
        ProfilingOp::Doctor,
        vec!["One4MBFile".to_string(), "One64MBFile".to_string()],
    );
    sets.insert(
        ProfilingOp::Flame,
        vec!["One4MBFile".to_string(), "One64MBFile".to_string()],
    );
    sets.insert(ProfilingOp::BubbleProf, vec!["One4MBFile".to_string()]);
    sets
}

/// Paths and folders the command templates are rendered against.
#[derive(Debug, Clone)]
pub struct CommandLayout {
    pub out_folder: String,
    pub tests_path: String,
    pub remote: bool,
}

impl CommandLayout {
    fn prelude(&self) -> &'static str {
        if self.remote {
            REMOTE_PRELUDE
        } else {
            ""
        }
    }

    pub fn benchmark_command(&self, test: &TestAbstract) -> String {
        let remote_flag = if self.remote { "REMOTE=true " } else { "" };
        format!(
            "{}OUT_FOLDER={} {}GUID={{job_id}} node {}/{}",
            self.prelude(),
            self.out_folder,
            remote_flag,
            self.tests_path.trim_end_matches('/'),
            test.file
        )
    }

    pub fn profiling_command(&self, test: &TestAbstract, op: ProfilingOp, file_set: &str) -> String {
        format!(
            "{}OUT_FOLDER={} GUID={{job_id}} FILESET=\"{}\" clinic {} --dest {}/{}/ -- node {}/{}",
            self.prelude(),
            self.out_folder,
            file_set,
            op.as_str(),
            self.out_folder,
            test.name,
            self.tests_path.trim_end_matches('/'),
            test.file
        )
    }
}

pub fn build_suite(
    tests: &[TestAbstract],
    file_sets: &BTreeMap<ProfilingOp, Vec<String>>,
    layout: &CommandLayout,
) -> Vec<BenchmarkTest> {
    tests
        .iter()
        .map(|test| {
            let mut profiling = BTreeMap::new();
            for op in ProfilingOp::ALL {
                let variants = file_sets
                    .get(&op)
                    .map(|sets| {
                        sets.iter()
                            .map(|file_set| ProfilingVariant {
                                operation: op,
                                file_set: file_set.clone(),
                                command: layout.profiling_command(test, op, file_set),
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                profiling.insert(op, variants);
            }
            BenchmarkTest {
                name: test.name.clone(),
                command: layout.benchmark_command(test),
                profiling,
            }
        })
        .collect()
}

/// First host of the `minions` group in an Ansible YAML inventory.
pub fn inventory_host(path: &Path) -> Result<Option<String>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let hosts = &value["all"]["children"]["minions"]["hosts"];
    let host = match hosts {
        serde_yaml::Value::Mapping(map) => map
            .keys()
            .next()
            .and_then(|k| k.as_str())
            .map(|s| s.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        _ => None,
    };
    Ok(host)
}

fn load_catalog_file(
    path: &Path,
) -> Result<(Vec<TestAbstract>, BTreeMap<ProfilingOp, Vec<String>>), ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: CatalogFile = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((
        parsed.tests,
        parsed.profiling.unwrap_or_else(default_profiling_file_sets),
    ))
}

fn parse_flag(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(|v| v.trim().to_ascii_lowercase()),
        Some(ref v) if v == "on" || v == "true" || v == "1" || v == "yes"
    )
}

fn parse_number<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
            key,
            message: format!("not a number: {}", raw),
        }),
    }
}

fn home_dir<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup("HOME")
        .or_else(|| lookup("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let stage = Stage::parse(&lookup("STAGE").unwrap_or_default())?;
        let out_folder = lookup("OUT_FOLDER").unwrap_or_else(|| "/tmp/out".to_string());
        let data_dir = PathBuf::from(lookup("DATADIR").unwrap_or_else(|| "./data".to_string()));
        let runs_root = lookup("RUNS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("bench-runner"));
        let log_file = lookup("LOG_FILE").map(PathBuf::from).unwrap_or_else(|| {
            runs_root
                .join(chrono::Utc::now().timestamp_millis().to_string())
                .join("stdout.log")
        });
        let log_level = lookup("LOGLEVEL").unwrap_or_else(|| "info".to_string());

        let home = home_dir(&lookup);
        let key = lookup("BENCHMARK_KEY")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".ssh").join("id_rsa"));
        let inventory = PathBuf::from(
            lookup("INVENTORY")
                .unwrap_or_else(|| "infrastructure/inventory/inventory.yaml".to_string()),
        );
        let playbook = lookup("PLAYBOOK")
            .unwrap_or_else(|| "infrastructure/playbooks/benchmarks.yaml".to_string());
        let host = match lookup("BENCHMARK_HOST") {
            Some(host) => Some(host),
            None if inventory.exists() => inventory_host(&inventory)?,
            None => None,
        };
        let remote = host.map(|host| RemoteTarget {
            host,
            user: lookup("BENCHMARK_USER").unwrap_or_else(|| "benchmarks".to_string()),
            key: key.clone(),
        });
        if stage == Stage::Remote && remote.is_none() {
            return Err(ConfigError::Invalid {
                key: "BENCHMARK_HOST",
                message: format!(
                    "remote stage needs a benchmark host (set BENCHMARK_HOST or provide {})",
                    inventory.display()
                ),
            });
        }

        let tests_folder = lookup("TESTS_FOLDER").unwrap_or_else(|| "./tests".to_string());
        let remote_folder = lookup("REMOTE_FOLDER").unwrap_or_else(|| "~/ipfs/tests/".to_string());
        let (abstracts, file_sets) = match lookup("BENCHMARK_TESTS") {
            Some(path) => load_catalog_file(Path::new(&path))?,
            None => (default_test_abstracts(), default_profiling_file_sets()),
        };
        let local_layout = CommandLayout {
            out_folder: out_folder.clone(),
            tests_path: tests_folder,
            remote: false,
        };
        let remote_layout = CommandLayout {
            out_folder: out_folder.clone(),
            tests_path: remote_folder,
            remote: true,
        };
        let catalog = BenchmarkCatalog {
            local: build_suite(&abstracts, &file_sets, &local_layout),
            remote: build_suite(&abstracts, &file_sets, &remote_layout),
        };

        let api_key = lookup("API_KEY");
        let api_key_defaulted = api_key.is_none();
        let nightly_hour = parse_number("NIGHTLY_HOUR", lookup("NIGHTLY_HOUR"), 0u32)?;
        if nightly_hour > 23 {
            return Err(ConfigError::Invalid {
                key: "NIGHTLY_HOUR",
                message: format!("hour out of range: {}", nightly_hour),
            });
        }

        Ok(Config {
            stage,
            out_folder: out_folder.clone(),
            data_dir,
            runs_root,
            log_file,
            log_level,
            keep_run_dirs: parse_flag(lookup("KEEP_RUN_DIRS")),
            command_timeout: Duration::from_secs(parse_number(
                "COMMAND_TIMEOUT_SECS",
                lookup("COMMAND_TIMEOUT_SECS"),
                3600u64,
            )?),
            nightly_hour,
            provision_command: lookup("PROVISION_COMMAND").unwrap_or_else(|| {
                format!(
                    "ansible-playbook -i {} --key-file {} {}",
                    inventory.display(),
                    key.display(),
                    playbook
                )
            }),
            server: ServerConfig {
                port: parse_number("PORT", lookup("PORT"), 9000u16)?,
                api_key: api_key.unwrap_or_else(|| "supersecret".to_string()),
                api_key_defaulted,
            },
            influx: InfluxConfig {
                host: lookup("INFLUX_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: parse_number("INFLUX_PORT", lookup("INFLUX_PORT"), 8086u16)?,
                database: lookup("INFLUX_DB").unwrap_or_else(|| "benchmarks".to_string()),
            },
            ipfs: IpfsConfig {
                api_url: lookup("IPFS_API_URL")
                    .unwrap_or_else(|| "http://127.0.0.1:5001".to_string()),
                user: lookup("IPFS_USER"),
                password: lookup("IPFS_PASSWORD"),
            },
            benchmarks: BenchmarksConfig {
                clinic_enabled: parse_flag(lookup("CLINIC")),
                remote,
                catalog,
                cleanup: format!("rm -Rf {}/*", out_folder),
            },
        })
    }

    /// Location of the restart journal.
    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("queue_journal.json")
    }

    pub fn is_remote(&self) -> bool {
        self.stage == Stage::Remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_build_local_stage_with_full_catalogue() {
        let cfg = Config::from_lookup(lookup_from(&[("HOME", "/home/bench")])).expect("config");
        assert_eq!(cfg.stage, Stage::Local);
        assert_eq!(cfg.out_folder, "/tmp/out");
        assert_eq!(cfg.server.port, 9000);
        assert!(cfg.server.api_key_defaulted);
        assert!(!cfg.benchmarks.clinic_enabled);
        assert_eq!(cfg.benchmarks.catalog.local.len(), DEFAULT_TESTS.len());
        assert_eq!(cfg.benchmarks.cleanup, "rm -Rf /tmp/out/*");
        assert_eq!(cfg.command_timeout, Duration::from_secs(3600));
        let first = &cfg.benchmarks.catalog.local[0];
        assert_eq!(first.name, "localTransfer");
        assert_eq!(first.variants(ProfilingOp::Doctor).len(), 2);
        assert_eq!(first.variants(ProfilingOp::Flame).len(), 2);
        assert_eq!(first.variants(ProfilingOp::BubbleProf).len(), 1);
    }

    #[test]
    fn remote_stage_requires_a_host() {
        let err = Config::from_lookup(lookup_from(&[
            ("STAGE", "remote"),
            ("INVENTORY", "/nonexistent/inventory.yaml"),
        ]))
        .expect_err("missing host must fail");
        assert!(err.to_string().contains("BENCHMARK_HOST"), "{}", err);
    }

    #[test]
    fn remote_commands_carry_prelude_and_remote_flag() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("STAGE", "remote"),
            ("BENCHMARK_HOST", "bench.example.org"),
            ("BENCHMARK_USER", "runner"),
            ("REMOTE_FOLDER", "~/ipfs/tests/"),
        ]))
        .expect("config");
        let target = cfg.benchmarks.remote.as_ref().expect("remote target");
        assert_eq!(target.host, "bench.example.org");
        assert_eq!(target.user, "runner");
        let test = &cfg.benchmarks.catalog.remote[0];
        assert!(test.command.starts_with("killall node"), "{}", test.command);
        assert!(test.command.contains("REMOTE=true"), "{}", test.command);
        assert!(test.command.ends_with("node ~/ipfs/tests/local-transfer.js"));
        let local = &cfg.benchmarks.catalog.local[0];
        assert!(!local.command.contains("REMOTE=true"));
    }

    #[test]
    fn command_template_substitutes_job_id() {
        let cfg = Config::from_lookup(lookup_from(&[])).expect("config");
        let test = &cfg.benchmarks.catalog.local[0];
        let rendered = test.render_command("job_42");
        assert!(rendered.contains("GUID=job_42"), "{}", rendered);
        assert!(!rendered.contains("{job_id}"));
        let variant = &test.variants(ProfilingOp::Doctor)[0];
        assert!(variant
            .command
            .contains("clinic doctor --dest /tmp/out/localTransfer/"));
        assert!(variant.command.contains("FILESET=\"One4MBFile\""));
    }

    #[test]
    fn inventory_host_reads_first_minion() {
        let dir = std::env::temp_dir().join(format!(
            "bench_core_inventory_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("inventory.yaml");
        fs::write(
            &path,
            "all:\n  children:\n    minions:\n      hosts:\n        10.0.0.7:\n          ansible_user: bench\n",
        )
        .expect("write");
        assert_eq!(
            inventory_host(&path).expect("parse").as_deref(),
            Some("10.0.0.7")
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn invalid_numbers_are_reported_with_their_key() {
        let err = Config::from_lookup(lookup_from(&[("PORT", "ninety")]))
            .expect_err("bad port");
        assert!(err.to_string().contains("PORT"), "{}", err);
        let err = Config::from_lookup(lookup_from(&[("NIGHTLY_HOUR", "24")]))
            .expect_err("bad hour");
        assert!(err.to_string().contains("NIGHTLY_HOUR"), "{}", err);
    }

    #[test]
    fn clinic_flag_accepts_on_and_true() {
        let on = Config::from_lookup(lookup_from(&[("CLINIC", "ON")])).expect("config");
        assert!(on.benchmarks.clinic_enabled);
        let yes = Config::from_lookup(lookup_from(&[("CLINIC", "true")])).expect("config");
        assert!(yes.benchmarks.clinic_enabled);
        let off = Config::from_lookup(lookup_from(&[("CLINIC", "off")])).expect("config");
        assert!(!off.benchmarks.clinic_enabled);
    }
}
