use playlab_core::{
    ArchiveKind, InstallSource, PlatformProfile, PortRequest, PortSet, RetryPolicy, ServiceSpec,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENGINE_NAME: &str = "questdb";
pub const NOTEBOOK_NAME: &str = "jupyterlab";

const ENGINE_VERSION: &str = "6.7";
pub const ENGINE_MARKER: &str = "questdb.jar";

/// Notebook document served alongside the hosted playground.
pub const NOTEBOOK_DOC_URL: &str = "https://play.questdb.io/notebooks/play.ipynb";
pub const NOTEBOOK_DOC_NAME: &str = "play.ipynb";

/// Position of the parameter cell the port values are written into. The
/// published notebook keeps this cell right after the intro cell; that layout
/// is its side of the contract.
pub const NOTEBOOK_PARAMETER_CELL: usize = 1;

const ENGINE_PORTS: &[PortRequest] = &[
    PortRequest { name: "http", contained: 9000 },
    PortRequest { name: "sql", contained: 8812 },
    PortRequest { name: "ilp", contained: 9009 },
];

const NOTEBOOK_PORTS: &[PortRequest] = &[PortRequest { name: "http", contained: 8888 }];

fn engine_archive_url(kind: ArchiveKind) -> String {
    let ext = match kind {
        ArchiveKind::TarGz => "tar.gz",
        ArchiveKind::Zip => "zip",
    };
    format!(
        "https://github.com/questdb/questdb/releases/download/{ENGINE_VERSION}\
         /questdb-{ENGINE_VERSION}-no-jre-bin.{ext}"
    )
}

/// The data engine: downloaded archive, launched on the JVM, probed over HTTP.
pub fn engine_spec(profile: &PlatformProfile) -> ServiceSpec {
    ServiceSpec {
        name: ENGINE_NAME.into(),
        install: InstallSource::Archive {
            url: engine_archive_url(profile.archive_kind),
            marker: ENGINE_MARKER.into(),
        },
        ports: ENGINE_PORTS.to_vec(),
        // Full JVM warm-up can be slow on first start.
        readiness: RetryPolicy {
            timeout: Duration::from_secs(60),
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(5),
            lead_delay: Duration::from_millis(100),
        },
    }
}

/// The notebook server: venv-installed, announces itself in its own log.
pub fn notebook_spec() -> ServiceSpec {
    ServiceSpec {
        name: NOTEBOOK_NAME.into(),
        install: InstallSource::Preinstalled {
            path: PathBuf::from("venv"),
        },
        ports: NOTEBOOK_PORTS.to_vec(),
        // The startup banner appears quickly once the server runs.
        readiness: RetryPolicy {
            timeout: Duration::from_secs(30),
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(2),
            lead_delay: Duration::from_millis(100),
        },
    }
}

/// Override keys for the engine's `server.conf`, binding every listener to
/// the negotiated ports. The engine itself always binds the wildcard address;
/// whether probes and printed endpoints use loopback is the profile's call.
pub fn engine_conf_overrides(ports: &PortSet) -> BTreeMap<String, String> {
    let mut overrides = BTreeMap::new();
    let keys = [
        ("http", "http.bind.to"),
        ("sql", "pg.net.bind.to"),
        ("ilp", "line.tcp.net.bind.to"),
    ];
    for (logical, key) in keys {
        if let Some(port) = ports.get(logical) {
            overrides.insert(key.to_string(), format!("0.0.0.0:{port}"));
        }
    }
    overrides
}

/// Launch arguments for the engine JVM.
pub fn engine_launch_args(jar_path: &Path, data_dir: &Path) -> Vec<String> {
    vec![
        "-DQuestDB-Runtime-0".into(),
        "-ea".into(),
        "-XX:+UnlockExperimentalVMOptions".into(),
        "-XX:+AlwaysPreTouch".into(),
        "-p".into(),
        jar_path.display().to_string(),
        "-m".into(),
        "io.questdb/io.questdb.ServerMain".into(),
        "-d".into(),
        data_dir.display().to_string(),
    ]
}

/// Launch arguments for the notebook server. The port is passed directly;
/// no interactive input is expected.
pub fn notebook_launch_args(port: u16, bind_host: &str) -> Vec<String> {
    vec![
        "--no-browser".into(),
        format!("--ip={bind_host}"),
        format!("--port={port}"),
    ]
}

/// Literal declarations written into the notebook's parameter cell.
pub fn notebook_parameter_lines(host: &str, engine_ports: &PortSet) -> Vec<String> {
    let mut lines = vec![format!("qdb_host = '{host}'")];
    for (name, port) in engine_ports.iter() {
        lines.push(format!("qdb_{name}_port = {port}"));
    }
    lines
}

/// Locates a `java` executable, preferring `JAVA_HOME/bin` over `PATH`.
pub fn find_java(exe_suffix: &str) -> Option<PathBuf> {
    let java = format!("java{exe_suffix}");
    if let Ok(home) = std::env::var("JAVA_HOME") {
        let candidate = Path::new(&home).join("bin").join(&java);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    std::env::var_os("PATH").and_then(|path| {
        std::env::split_paths(&path)
            .map(|dir| dir.join(&java))
            .find(|candidate| candidate.is_file())
    })
}

/// Parses the major version out of `java -version` output. Handles both the
/// modern `"17.0.2"` and the legacy `"1.8.0_292"` schemes.
pub fn parse_java_major(version_output: &str) -> Option<u32> {
    let quoted = version_output.split('"').nth(1)?;
    let mut numbers = quoted.split(['.', '_']);
    let first: u32 = numbers.next()?.parse().ok()?;
    if first == 1 {
        numbers.next()?.parse().ok()
    } else {
        Some(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playlab_core::{PlatformProfile, RuntimeEnvironment};

    #[test]
    fn engine_archive_url_matches_platform_archive_kind() {
        assert!(engine_archive_url(ArchiveKind::TarGz).ends_with("-no-jre-bin.tar.gz"));
        assert!(engine_archive_url(ArchiveKind::Zip).ends_with("-no-jre-bin.zip"));
    }

    #[test]
    fn engine_overrides_cover_every_listener() {
        let mut ports = PortSet::new();
        ports.insert("http", 41000);
        ports.insert("sql", 41001);
        ports.insert("ilp", 41002);

        let overrides = engine_conf_overrides(&ports);
        assert_eq!(overrides["http.bind.to"], "0.0.0.0:41000");
        assert_eq!(overrides["pg.net.bind.to"], "0.0.0.0:41001");
        assert_eq!(overrides["line.tcp.net.bind.to"], "0.0.0.0:41002");
    }

    #[test]
    fn parameter_lines_declare_host_and_ports() {
        let mut ports = PortSet::new();
        ports.insert("http", 41000);
        ports.insert("sql", 41001);

        let lines = notebook_parameter_lines("127.0.0.1", &ports);
        assert_eq!(lines[0], "qdb_host = '127.0.0.1'");
        assert!(lines.contains(&"qdb_http_port = 41000".to_string()));
        assert!(lines.contains(&"qdb_sql_port = 41001".to_string()));
    }

    #[test]
    fn java_major_version_parsing() {
        assert_eq!(parse_java_major("openjdk version \"17.0.2\" 2022-01-18"), Some(17));
        assert_eq!(parse_java_major("java version \"11.0.15\""), Some(11));
        assert_eq!(parse_java_major("java version \"1.8.0_292\""), Some(8));
        assert_eq!(parse_java_major("no version here"), None);
    }

    #[test]
    fn specs_request_distinct_logical_ports() {
        let profile = PlatformProfile::resolve(RuntimeEnvironment::Local);
        for spec in [engine_spec(&profile), notebook_spec()] {
            let mut names: Vec<_> = spec.ports.iter().map(|p| p.name).collect();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), spec.ports.len());
        }
    }
}
