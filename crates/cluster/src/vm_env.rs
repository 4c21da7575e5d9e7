use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use environment::{AccessInfo, ResourceUsage, Status, ports, render_access_info};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domxml;
use crate::error::EnvError;
use crate::forward::{ForwardHandle, PortForwarder};
use crate::hypervisor::{DomainState, Hypervisor, HypervisorError};
use crate::neigh::Neighbors;
use crate::overlay::{OverlayError, OverlayManager, overlay_path};

/// Placeholders every domain template must provide.
const PLACEHOLDERS: [&str; 4] = [
    "{{VM_NAME}}",
    "{{DISK_IMAGE}}",
    "{{VM_UUID}}",
    "{{NETWORK_NAME}}",
];

#[derive(Debug, thiserror::Error)]
pub enum VmEnvError {
    #[error("xml template is missing placeholders: {0}")]
    MissingPlaceholders(String),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error("hypervisor failure for {name}: {source}")]
    Hypervisor {
        name: String,
        #[source]
        source: HypervisorError,
    },

    #[error("vm domain {0} was not created")]
    DomainNotCreated(String),
}

/// Host-side collaborators a VM instance needs.
#[derive(Clone)]
pub struct VmStack {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub overlays: Arc<dyn OverlayManager>,
    pub forwarder: Arc<dyn PortForwarder>,
    pub neighbors: Arc<dyn Neighbors>,
}

/// Static description of one VM environment instance.
pub struct VmEnvConfig {
    /// Domain name, unique per session (`<session>-<env>`).
    pub name: String,
    pub display_name: String,
    /// Domain XML template with the required placeholders.
    pub template: String,
    pub base_image: PathBuf,
    pub overlay_dir: PathBuf,
    pub internal_ports: Vec<u16>,
    pub published_ports: Vec<u16>,
    pub access_template: String,
    /// Bridge (and libvirt network) the VM attaches to.
    pub network_name: String,
    pub boot_poll_interval: Duration,
    pub boot_timeout: Duration,
}

/// One virtual-machine workload. Cheap to clone so the detached
/// boot-watch task can share the instance it observes.
#[derive(Clone)]
pub struct VmEnvironment {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for VmEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmEnvironment")
            .field("name", &self.inner.config.name)
            .finish_non_exhaustive()
    }
}

struct Inner {
    stack: VmStack,
    config: VmEnvConfig,
    overlay: PathBuf,
    defined: AtomicBool,
    destroyed: AtomicBool,
    ip: Mutex<Option<String>>,
    forwarders: AsyncMutex<Vec<Box<dyn ForwardHandle>>>,
}

impl VmEnvironment {
    /// Create the instance and its copy-on-write overlay.
    pub async fn new(stack: VmStack, config: VmEnvConfig) -> Result<Self, EnvError> {
        ports::validate_mapping(&config.internal_ports, &config.published_ports).map_err(
            |detail| EnvError::PortMapping {
                name: config.name.clone(),
                detail,
            },
        )?;

        let overlay = overlay_path(&config.overlay_dir, &config.name);
        stack
            .overlays
            .create(&config.base_image, &overlay)
            .await
            .map_err(VmEnvError::Overlay)?;

        info!(name = %config.name, overlay = %overlay.display(), "created vm environment");
        Ok(Self {
            inner: Arc::new(Inner {
                stack,
                config,
                overlay,
                defined: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                ip: Mutex::new(None),
                forwarders: AsyncMutex::new(Vec::new()),
            }),
        })
    }

    pub fn display_name(&self) -> &str {
        &self.inner.config.display_name
    }

    pub fn published_ports(&self) -> &[u16] {
        &self.inner.config.published_ports
    }

    fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    fn is_defined(&self) -> bool {
        self.inner.defined.load(Ordering::Acquire)
    }

    fn cached_ip(&self) -> Option<String> {
        self.inner.ip.lock().ok().and_then(|ip| ip.clone())
    }

    fn hypervisor_error(&self, source: HypervisorError) -> VmEnvError {
        VmEnvError::Hypervisor {
            name: self.inner.config.name.clone(),
            source,
        }
    }

    /// Substitute the required placeholders; a fresh UUID per start.
    fn render_xml(&self) -> Result<String, VmEnvError> {
        let template = &self.inner.config.template;
        let missing: Vec<&str> = PLACEHOLDERS
            .iter()
            .copied()
            .filter(|ph| !template.contains(ph))
            .collect();
        if !missing.is_empty() {
            return Err(VmEnvError::MissingPlaceholders(missing.join(", ")));
        }

        Ok(template
            .replace("{{VM_NAME}}", &self.inner.config.name)
            .replace("{{DISK_IMAGE}}", &self.inner.overlay.to_string_lossy())
            .replace("{{VM_UUID}}", &Uuid::new_v4().to_string())
            .replace("{{NETWORK_NAME}}", &self.inner.config.network_name))
    }

    /// Define and start the domain, then hand off to the boot-watch.
    ///
    /// Any failure here removes the overlay so nothing of the instance
    /// survives a failed start.
    pub async fn start(&self) -> Result<(), VmEnvError> {
        let name = &self.inner.config.name;

        let xml = match self.render_xml() {
            Ok(xml) => xml,
            Err(e) => {
                error!(name = %name, error = %e, "failed to render domain xml");
                self.inner.stack.overlays.remove(&self.inner.overlay).await;
                return Err(e);
            }
        };

        if let Err(e) = self.inner.stack.hypervisor.define_domain(&xml).await {
            error!(name = %name, error = %e, "failed to define domain");
            self.inner.stack.overlays.remove(&self.inner.overlay).await;
            return Err(self.hypervisor_error(e));
        }
        self.inner.defined.store(true, Ordering::Release);

        if let Err(e) = self.inner.stack.hypervisor.start_domain(name).await {
            error!(name = %name, error = %e, "failed to start domain");
            self.inner.stack.overlays.remove(&self.inner.overlay).await;
            return Err(self.hypervisor_error(e));
        }

        info!(name = %name, "created vm domain");

        let vm = self.clone();
        tokio::spawn(async move { vm.boot_watch().await });
        Ok(())
    }

    /// Poll until the instance leaves `Booting`, then wire up port
    /// forwarders; give up after the boot timeout and self-destruct.
    ///
    /// A manual destroy during boot is observed through the destroyed
    /// flag: the watcher exits without forwarding and without a second
    /// destroy.
    async fn boot_watch(self) {
        let name = &self.inner.config.name;
        debug!(name = %name, "waiting for vm to finish booting");

        let deadline = Instant::now() + self.inner.config.boot_timeout;
        loop {
            if self.is_destroyed() {
                debug!(name = %name, "vm destroyed during boot, stopping watch");
                return;
            }

            match self.status().await {
                Ok(Status::Booting) => {}
                Ok(_) => {
                    if self.is_destroyed() {
                        return;
                    }
                    self.on_started().await;
                    return;
                }
                Err(e) => debug!(name = %name, error = %e, "status poll failed during boot"),
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.inner.config.boot_poll_interval).await;
        }

        error!(
            name = %name,
            timeout_secs = self.inner.config.boot_timeout.as_secs(),
            "vm did not finish booting in time"
        );
        self.destroy().await;
    }

    /// Start one forwarder per published port, now that the IP is known.
    async fn on_started(&self) {
        let name = &self.inner.config.name;
        debug!(name = %name, "vm booted");

        let Some(ip) = self.cached_ip() else {
            error!(name = %name, "vm left booting state without an ip, skipping port forwards");
            return;
        };

        for (internal, published) in ports::pairs(
            &self.inner.config.internal_ports,
            &self.inner.config.published_ports,
        ) {
            match self.inner.stack.forwarder.forward(&ip, internal, published).await {
                Ok(handle) => self.inner.forwarders.lock().await.push(handle),
                Err(e) => {
                    error!(name = %name, port = published, error = %e, "failed to start port forwarder");
                }
            }
        }
    }

    pub async fn restart(&self) -> Result<(), VmEnvError> {
        let name = &self.inner.config.name;
        if !self.is_defined() {
            error!(name = %name, "tried to restart a domain that was not created");
            return Err(VmEnvError::DomainNotCreated(name.clone()));
        }

        self.inner
            .stack
            .hypervisor
            .reboot_domain(name)
            .await
            .map_err(|e| self.hypervisor_error(e))?;
        info!(name = %name, "restarted vm domain");
        Ok(())
    }

    pub async fn status(&self) -> Result<Status, VmEnvError> {
        if !self.is_defined() {
            return Ok(Status::Unknown);
        }

        if self.discover_ip().await?.is_none() {
            return Ok(Status::Booting);
        }

        let state = self
            .inner
            .stack
            .hypervisor
            .domain_state(&self.inner.config.name)
            .await
            .map_err(|e| self.hypervisor_error(e))?;

        Ok(match state {
            DomainState::Running | DomainState::Blocked => Status::Running,
            DomainState::Paused
            | DomainState::Shutdown
            | DomainState::Shutoff
            | DomainState::PmSuspended => Status::Paused,
            DomainState::NoState | DomainState::Crashed => Status::Unknown,
        })
    }

    /// Find the VM's IP via its MAC on the cluster bridge and the host
    /// neighbor table. The first hit is cached for the instance's
    /// lifetime.
    async fn discover_ip(&self) -> Result<Option<String>, VmEnvError> {
        if let Some(ip) = self.cached_ip() {
            return Ok(Some(ip));
        }

        let xml = self
            .inner
            .stack
            .hypervisor
            .domain_xml(&self.inner.config.name)
            .await
            .map_err(|e| self.hypervisor_error(e))?;

        let Some(mac) = domxml::interface_mac_on_bridge(&xml, &self.inner.config.network_name)
        else {
            return Ok(None);
        };
        let Some(ip) = self.inner.stack.neighbors.find_by_mac(&mac).await else {
            return Ok(None);
        };

        if let Ok(mut slot) = self.inner.ip.lock() {
            *slot = Some(ip.clone());
        }
        debug!(name = %self.inner.config.name, ip = %ip, "vm acquired ip");
        Ok(Some(ip))
    }

    pub fn access_info(&self) -> AccessInfo {
        let ip = self.cached_ip();
        render_access_info(
            &self.inner.config.access_template,
            ip.as_deref(),
            &ports::pairs(
                &self.inner.config.internal_ports,
                &self.inner.config.published_ports,
            ),
        )
    }

    /// Usage sample. Memory prefers guest RSS, then the balloon's actual
    /// size, then the hypervisor's used-memory figure; traffic is summed
    /// over the domain's interfaces. Any read error contributes zero.
    pub async fn resources(&self) -> ResourceUsage {
        if !self.is_defined() {
            return ResourceUsage::default();
        }
        let name = &self.inner.config.name;
        let hypervisor = &self.inner.stack.hypervisor;

        let memory_kib = match hypervisor.domain_memory_stats(name).await {
            Ok(stats) => match stats.rss_kib.or(stats.actual_kib) {
                Some(kib) => kib,
                None => hypervisor.domain_used_memory_kib(name).await.unwrap_or(0),
            },
            Err(e) => {
                warn!(name = %name, error = %e, "failed to read vm memory stats");
                0
            }
        };

        let mut rx = 0u64;
        let mut tx = 0u64;
        if let Ok(xml) = hypervisor.domain_xml(name).await {
            for dev in domxml::interface_target_devs(&xml) {
                if let Ok(stats) = hypervisor.interface_stats(name, &dev).await {
                    rx = rx.saturating_add(stats.rx_bytes);
                    tx = tx.saturating_add(stats.tx_bytes);
                }
            }
        }

        ResourceUsage::new(memory_kib.saturating_mul(1024), rx, tx)
    }

    /// Tear the instance down: forwarders, domain, overlay.
    ///
    /// The overlay is removed even if the domain never started, so a
    /// stopped session leaves no disk state behind. Repeated calls are
    /// no-ops.
    pub async fn destroy(&self) {
        let name = &self.inner.config.name;
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            debug!(name = %name, "vm already destroyed");
            return;
        }

        let mut forwarders = self.inner.forwarders.lock().await;
        for handle in forwarders.iter_mut() {
            handle.terminate().await;
        }
        forwarders.clear();
        drop(forwarders);

        if self.inner.defined.swap(false, Ordering::AcqRel) {
            self.inner.stack.hypervisor.destroy_domain(name).await;
            self.inner.stack.hypervisor.undefine_domain(name).await;
        } else {
            warn!(name = %name, "tried to destroy a domain that was not created");
        }

        self.inner.stack.overlays.remove(&self.inner.overlay).await;
        info!(name = %name, "removed vm environment");
    }
}
