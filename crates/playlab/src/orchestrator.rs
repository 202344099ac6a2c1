use crate::installer::{ArtifactInstaller, prepare_python_env};
use crate::readiness::{HttpProbe, LogMarkerProbe, ReadinessStrategy, await_ready};
use crate::services::{
    self, ENGINE_MARKER, ENGINE_NAME, NOTEBOOK_DOC_NAME, NOTEBOOK_DOC_URL,
    NOTEBOOK_PARAMETER_CELL,
};
use crate::supervisor::ProcessSupervisor;
use playlab_core::{
    InstallSource, PlatformProfile, PlayError, PortAllocator, PortSet, ServiceSpec, ServiceState,
    patch_notebook_cell, patch_properties,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const ENGINE: usize = 0;
const NOTEBOOK: usize = 1;

const WORKDIR_README: &str = "Directory and contents created by playlab.\n\
    If you don't recognize this directory, you can safely delete it.\n";

/// One service plus everything the run has learned about it so far.
pub struct ManagedService {
    pub spec: ServiceSpec,
    pub state: ServiceState,
    pub ports: PortSet,
    pub home: PathBuf,
    pub supervisor: ProcessSupervisor,
    pub endpoints: Vec<String>,
}

impl ManagedService {
    fn new(spec: ServiceSpec, workdir: &Path) -> Self {
        let home = workdir.join(&spec.name);
        let log_path = home.join("data/log").join(format!("{}.log", spec.name));
        ManagedService {
            supervisor: ProcessSupervisor::new(spec.name.clone(), log_path),
            spec,
            state: ServiceState::Uninstalled,
            ports: PortSet::new(),
            home,
            endpoints: Vec::new(),
        }
    }

    fn advance(&mut self, next: ServiceState) {
        debug_assert!(
            self.state.may_become(next),
            "{}: illegal transition {:?} -> {:?}",
            self.spec.name,
            self.state,
            next
        );
        self.state = next;
    }
}

/// Outcome of driving a run to the "everything is up" point.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Ready,
    Interrupted,
}

/// Composes the whole bootstrap: concurrent installs, port negotiation,
/// config patching, supervised starts with readiness detection, and
/// reverse-order teardown. The working area is a uniquely named temporary
/// directory owned by this run alone; it deletes itself on every exit path.
pub struct Orchestrator {
    profile: PlatformProfile,
    workdir: TempDir,
    installer: ArtifactInstaller,
    services: Vec<ManagedService>,
    started: Vec<usize>,
    venv_bin: Option<PathBuf>,
    shutdown_token: CancellationToken,
}

impl Orchestrator {
    pub fn new(profile: PlatformProfile) -> Result<Self, PlayError> {
        let workdir = tempfile::Builder::new().prefix("playlab_").tempdir()?;
        std::fs::write(workdir.path().join("README.txt"), WORKDIR_README)?;
        info!(workdir = %workdir.path().display(), "created working area");

        let services = vec![
            ManagedService::new(services::engine_spec(&profile), workdir.path()),
            ManagedService::new(services::notebook_spec(), workdir.path()),
        ];
        Ok(Orchestrator {
            profile,
            workdir,
            installer: ArtifactInstaller::new(),
            services,
            started: Vec::new(),
            venv_bin: None,
            shutdown_token: CancellationToken::new(),
        })
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    /// Cancelling this token interrupts the run wherever it happens to be;
    /// teardown still executes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn services(&self) -> &[ManagedService] {
        &self.services
    }

    /// Drives the run until both services are ready. Any failure or an
    /// interrupt stops whatever already started, in reverse start order,
    /// before returning.
    pub async fn run(&mut self) -> Result<RunOutcome, PlayError> {
        let token = self.shutdown_token.clone();
        let outcome = tokio::select! {
            // An interrupt beats whatever startup step is in flight.
            biased;
            _ = token.cancelled() => {
                info!("interrupted during startup");
                Ok(RunOutcome::Interrupted)
            }
            result = Self::run_to_ready(
                &self.profile,
                &self.workdir,
                &self.installer,
                &mut self.services,
                &mut self.started,
                &mut self.venv_bin,
            ) => result.map(|()| RunOutcome::Ready),
        };

        match outcome {
            Ok(RunOutcome::Ready) => Ok(RunOutcome::Ready),
            Ok(RunOutcome::Interrupted) => {
                self.shutdown().await;
                Ok(RunOutcome::Interrupted)
            }
            Err(e) => {
                error!("startup failed: {e}");
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn run_to_ready(
        profile: &PlatformProfile,
        workdir: &TempDir,
        installer: &ArtifactInstaller,
        services: &mut Vec<ManagedService>,
        started: &mut Vec<usize>,
        venv_bin: &mut Option<PathBuf>,
    ) -> Result<(), PlayError> {
        Self::install_all(profile, workdir, installer, services, venv_bin).await?;
        Self::allocate_ports(profile, services)?;
        Self::patch_configs(profile, services)?;
        Self::start_engine(profile, services, started).await?;
        Self::start_notebook(profile, services, started, venv_bin.as_deref()).await?;
        Ok(())
    }

    /// Installation tasks are independent and long-latency, so they run
    /// concurrently: the engine archive download on one task, the Python
    /// environment plus notebook document on another. All of them are joined
    /// before anything depends on their output; the first error wins but the
    /// siblings are allowed to finish.
    async fn install_all(
        profile: &PlatformProfile,
        workdir: &TempDir,
        installer: &ArtifactInstaller,
        services: &mut [ManagedService],
        venv_bin: &mut Option<PathBuf>,
    ) -> Result<(), PlayError> {
        let mut tasks: JoinSet<(usize, Result<Option<PathBuf>, PlayError>)> = JoinSet::new();

        if let InstallSource::Archive { url, marker } = services[ENGINE].spec.install.clone() {
            let installer = installer.clone();
            let kind = profile.archive_kind;
            let staging = workdir.path().join("download");
            let dest = services[ENGINE].home.join("bin");
            tasks.spawn(async move {
                let result = installer.install(&url, kind, &staging, &dest, &marker).await;
                (ENGINE, result.map(|()| None))
            });
        }

        // The notebook descriptor names where its environment lives; joining
        // an absolute path leaves it untouched, so baked-in container
        // environments resolve as-is while the default lands in the workdir.
        let venv_dir = match &services[NOTEBOOK].spec.install {
            InstallSource::Preinstalled { path } => workdir.path().join(path),
            InstallSource::Archive { .. } => workdir.path().join("venv"),
        };
        let notebooks_dir = services[NOTEBOOK].home.join("notebooks");
        let doc_installer = installer.clone();
        tasks.spawn(async move {
            let result = async {
                let bin_dir = prepare_python_env(&venv_dir).await?;
                tokio::fs::create_dir_all(&notebooks_dir).await?;
                let doc = notebooks_dir.join(NOTEBOOK_DOC_NAME);
                if !doc.exists() {
                    doc_installer.download(NOTEBOOK_DOC_URL, &doc).await?;
                }
                Ok(Some(bin_dir))
            }
            .await;
            (NOTEBOOK, result)
        });

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Ok(payload))) => {
                    if let Some(bin_dir) = payload {
                        *venv_bin = Some(bin_dir);
                    }
                    services[idx].advance(ServiceState::Installed);
                    info!(service = %services[idx].spec.name, "installed");
                }
                Ok((idx, Err(e))) => {
                    services[idx].advance(ServiceState::Failed);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(PlayError::Io(std::io::Error::other(join_err)));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// All ports are negotiated before any process starts; a config must be
    /// fully known at launch, ports are never renegotiated afterwards.
    fn allocate_ports(
        profile: &PlatformProfile,
        services: &mut [ManagedService],
    ) -> Result<(), PlayError> {
        let mut allocator = PortAllocator::new();
        let contained = profile.environment.is_contained();
        for svc in services {
            let mut ports = PortSet::new();
            for request in &svc.spec.ports {
                let port = if contained {
                    allocator.reserve(request.contained);
                    request.contained
                } else {
                    allocator.allocate()?
                };
                ports.insert(request.name, port);
                info!(service = %svc.spec.name, name = request.name, port, "port assigned");
            }
            svc.ports = ports;
        }
        Ok(())
    }

    fn patch_configs(
        profile: &PlatformProfile,
        services: &mut [ManagedService],
    ) -> Result<(), PlayError> {
        // Engine: the default config ships inside the archive; the patched
        // copy keeps every default line (disabled) for diagnosis.
        let engine = &services[ENGINE];
        let template_path = engine.home.join("bin/conf/server.conf");
        let template = match std::fs::read_to_string(&template_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let patched = patch_properties(&template, &services::engine_conf_overrides(&engine.ports));
        let conf_dir = engine.home.join("data/conf");
        std::fs::create_dir_all(&conf_dir)?;
        std::fs::write(conf_dir.join("server.conf"), patched)?;

        // Notebook: rewrite the parameter cell with the engine's ports.
        let lines = services::notebook_parameter_lines(profile.probe_host, &engine.ports);
        let doc_path = services[NOTEBOOK]
            .home
            .join("notebooks")
            .join(NOTEBOOK_DOC_NAME);
        let doc = std::fs::read_to_string(&doc_path)?;
        let patched = patch_notebook_cell(&doc, NOTEBOOK_PARAMETER_CELL, &lines)?;
        std::fs::write(&doc_path, patched)?;
        Ok(())
    }

    async fn start_engine(
        profile: &PlatformProfile,
        services: &mut [ManagedService],
        started: &mut Vec<usize>,
    ) -> Result<(), PlayError> {
        let java = services::find_java(profile.exe_suffix).ok_or_else(|| {
            PlayError::ProcessStart {
                service: ENGINE_NAME.into(),
                reason: "no java executable under JAVA_HOME or on PATH".into(),
            }
        })?;

        let engine = &mut services[ENGINE];
        let jar = engine.home.join("bin").join(ENGINE_MARKER);
        let data_dir = engine.home.join("data");
        std::fs::create_dir_all(&data_dir)?;
        let args = services::engine_launch_args(&jar, &data_dir);

        engine.advance(ServiceState::Starting);
        engine.supervisor.start(&java, &args, &data_dir).await?;
        started.push(ENGINE);

        let http = engine.ports.get("http").ok_or_else(|| {
            PlayError::ConfigFormat("engine has no http port assigned".into())
        })?;
        let url = format!("http://{}:{http}/", profile.probe_host);
        info!(url = %url, "waiting for the engine HTTP service");
        await_ready(
            &mut engine.supervisor,
            ReadinessStrategy::Endpoint(HttpProbe::new(&url)),
            &engine.spec.readiness,
        )
        .await?;
        engine.advance(ServiceState::Ready);

        let host = profile.probe_host;
        let sql = engine.ports.get("sql");
        let ilp = engine.ports.get("ilp");
        engine.endpoints.push(format!("Web console / REST API: {url}"));
        if let Some(sql) = sql {
            engine.endpoints.push(format!(
                "PSQL: psql -h {host} -p {sql} -U admin -d qdb  (password: quest)"
            ));
        }
        if let Some(ilp) = ilp {
            engine.endpoints.push(format!("ILP ingest port: {ilp}"));
        }
        info!(service = ENGINE_NAME, "ready");
        Ok(())
    }

    async fn start_notebook(
        profile: &PlatformProfile,
        services: &mut [ManagedService],
        started: &mut Vec<usize>,
        venv_bin: Option<&Path>,
    ) -> Result<(), PlayError> {
        let notebook = &mut services[NOTEBOOK];
        let bin_dir = venv_bin.ok_or_else(|| PlayError::ProcessStart {
            service: notebook.spec.name.clone(),
            reason: "python environment was never prepared".into(),
        })?;
        let command = bin_dir.join(format!("jupyter-lab{}", profile.exe_suffix));
        let port = notebook.ports.get("http").ok_or_else(|| {
            PlayError::ConfigFormat("notebook has no http port assigned".into())
        })?;
        let args = services::notebook_launch_args(port, profile.probe_host);
        let notebooks_dir = notebook.home.join("notebooks");

        notebook.advance(ServiceState::Starting);
        notebook.supervisor.start(&command, &args, &notebooks_dir).await?;
        started.push(NOTEBOOK);

        // The server announces its URL (with the access token) in its own
        // log; that line is the connection string we hand to the user.
        let marker = format!(":{port}/lab");
        let probe = LogMarkerProbe::new(notebook.supervisor.log_path(), marker);
        let line = await_ready(
            &mut notebook.supervisor,
            ReadinessStrategy::LogMarker(probe),
            &notebook.spec.readiness,
        )
        .await?;
        notebook.advance(ServiceState::Ready);

        let url = line
            .find("http")
            .map(|at| line[at..].to_string())
            .unwrap_or(line);
        notebook.endpoints.push(format!("JupyterLab: {url}"));
        info!(service = %notebook.spec.name, "ready");
        Ok(())
    }

    /// Connection info for everything that reached readiness.
    pub fn print_endpoints(&self) {
        println!("\nThe playground is up:\n");
        for svc in &self.services {
            for endpoint in &svc.endpoints {
                println!("  * {endpoint}");
            }
        }
        println!();
    }

    /// Stops every started service in reverse start order. Safe to call any
    /// number of times from any path (normal exit, interrupt, error unwind).
    pub async fn shutdown(&mut self) {
        while let Some(idx) = self.started.pop() {
            let svc = &mut self.services[idx];
            info!(service = %svc.spec.name, "stopping");
            svc.supervisor.stop().await;
            svc.advance(ServiceState::Stopped);
        }
    }
}
