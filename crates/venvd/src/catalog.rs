use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("duplicate cluster id {0}")]
    DuplicateCluster(i64),

    #[error("vm environment {0} has neither template nor template_file")]
    MissingTemplate(String),
}

/// A cluster definition: an ordered set of environment definitions.
#[derive(Debug, Clone)]
pub struct ClusterDef {
    pub id: i64,
    pub name: String,
    pub environments: Vec<EnvironmentDef>,
}

#[derive(Debug, Clone)]
pub struct EnvironmentDef {
    pub id: i64,
    pub name: String,
    /// Internal ports, in publish order.
    pub ports: Vec<u16>,
    pub access_info: String,
    pub kind: EnvKindDef,
}

#[derive(Debug, Clone)]
pub enum EnvKindDef {
    Docker(DockerDef),
    Vm(VmDef),
}

#[derive(Debug, Clone)]
pub struct DockerDef {
    pub image: String,
}

#[derive(Debug, Clone)]
pub struct VmDef {
    /// Domain XML template, fully resolved.
    pub template: String,
    pub base_image_path: String,
}

/// Read-only boundary to the definition store.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn cluster(&self, id: i64) -> Option<ClusterDef>;
}

// ---------------------------------------------------------------------------
// File schema
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CatalogFile {
    clusters: Vec<RawCluster>,
}

#[derive(Deserialize)]
struct RawCluster {
    id: i64,
    name: String,
    environments: Vec<RawEnvironment>,
}

#[derive(Deserialize)]
struct RawEnvironment {
    id: i64,
    name: String,
    #[serde(default)]
    ports: Vec<u16>,
    access_info: String,
    #[serde(flatten)]
    kind: RawKind,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawKind {
    Docker(RawDocker),
    Vm(RawVm),
}

#[derive(Deserialize)]
struct RawDocker {
    image: String,
}

#[derive(Deserialize)]
struct RawVm {
    #[serde(default)]
    template: Option<String>,
    /// File name resolved against the VM templates directory.
    #[serde(default)]
    template_file: Option<String>,
    base_image_path: String,
}

// ---------------------------------------------------------------------------
// YamlCatalog
// ---------------------------------------------------------------------------

/// File-backed catalog loaded once at startup.
#[derive(Debug)]
pub struct YamlCatalog {
    clusters: HashMap<i64, ClusterDef>,
}

impl YamlCatalog {
    pub async fn load(path: &Path, templates_dir: &Path) -> Result<Self, CatalogError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CatalogError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let file: CatalogFile =
            serde_yaml_ng::from_str(&content).map_err(|source| CatalogError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        let mut clusters = HashMap::new();
        for raw in file.clusters {
            let mut environments = Vec::with_capacity(raw.environments.len());
            for env in raw.environments {
                environments.push(resolve_environment(env, templates_dir).await?);
            }
            let id = raw.id;
            let def = ClusterDef {
                id,
                name: raw.name,
                environments,
            };
            if clusters.insert(id, def).is_some() {
                return Err(CatalogError::DuplicateCluster(id));
            }
        }

        info!(clusters = clusters.len(), path = %path.display(), "loaded cluster catalog");
        Ok(Self { clusters })
    }
}

async fn resolve_environment(
    raw: RawEnvironment,
    templates_dir: &Path,
) -> Result<EnvironmentDef, CatalogError> {
    let kind = match raw.kind {
        RawKind::Docker(docker) => EnvKindDef::Docker(DockerDef {
            image: docker.image,
        }),
        RawKind::Vm(vm) => {
            let template = match (vm.template, vm.template_file) {
                (Some(template), _) => template,
                (None, Some(file)) => {
                    let path = templates_dir.join(file);
                    tokio::fs::read_to_string(&path)
                        .await
                        .map_err(|source| CatalogError::Io {
                            path: path.display().to_string(),
                            source,
                        })?
                }
                (None, None) => return Err(CatalogError::MissingTemplate(raw.name)),
            };
            EnvKindDef::Vm(VmDef {
                template,
                base_image_path: vm.base_image_path,
            })
        }
    };

    Ok(EnvironmentDef {
        id: raw.id,
        name: raw.name,
        ports: raw.ports,
        access_info: raw.access_info,
        kind,
    })
}

#[async_trait]
impl Catalog for YamlCatalog {
    async fn cluster(&self, id: i64) -> Option<ClusterDef> {
        self.clusters.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG_YAML: &str = r#"
clusters:
  - id: 1
    name: web-stack
    environments:
      - id: 10
        name: web
        ports: [80, 22]
        access_info: "http://{{ip}}:{{80}}"
        docker:
          image: "echo:1"
      - id: 11
        name: win
        ports: [3389]
        access_info: "rdp://{{ip}}:{{3389}}"
        vm:
          template_file: win.xml
          base_image_path: /images/win7.qcow2
"#;

    #[tokio::test]
    async fn loads_clusters_with_both_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let catalog_path = dir.path().join("catalog.yaml");
        tokio::fs::write(&catalog_path, CATALOG_YAML).await.unwrap();
        tokio::fs::write(dir.path().join("win.xml"), "<domain>{{VM_NAME}}</domain>")
            .await
            .unwrap();

        let catalog = YamlCatalog::load(&catalog_path, dir.path()).await.unwrap();

        let def = catalog.cluster(1).await.unwrap();
        assert_eq!(def.name, "web-stack");
        assert_eq!(def.environments.len(), 2);

        assert_eq!(def.environments[0].ports, vec![80, 22]);
        assert!(matches!(
            &def.environments[0].kind,
            EnvKindDef::Docker(docker) if docker.image == "echo:1"
        ));
        assert!(matches!(
            &def.environments[1].kind,
            EnvKindDef::Vm(vm) if vm.template.contains("{{VM_NAME}}")
        ));

        assert!(catalog.cluster(2).await.is_none());
    }

    #[tokio::test]
    async fn inline_template_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let catalog_path = dir.path().join("catalog.yaml");
        let yaml = r#"
clusters:
  - id: 3
    name: vm-only
    environments:
      - id: 30
        name: box
        ports: [22]
        access_info: "ssh {{ip}} -p {{22}}"
        vm:
          template: "<domain/>"
          base_image_path: /images/base.qcow2
"#;
        tokio::fs::write(&catalog_path, yaml).await.unwrap();

        let catalog = YamlCatalog::load(&catalog_path, dir.path()).await.unwrap();
        let def = catalog.cluster(3).await.unwrap();
        assert!(matches!(
            &def.environments[0].kind,
            EnvKindDef::Vm(vm) if vm.template == "<domain/>"
        ));
    }

    #[tokio::test]
    async fn vm_without_template_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let catalog_path = dir.path().join("catalog.yaml");
        let yaml = r#"
clusters:
  - id: 4
    name: broken
    environments:
      - id: 40
        name: box
        ports: [22]
        access_info: "x"
        vm:
          base_image_path: /images/base.qcow2
"#;
        tokio::fs::write(&catalog_path, yaml).await.unwrap();

        let err = YamlCatalog::load(&catalog_path, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::MissingTemplate(name) if name == "box"));
    }

    #[tokio::test]
    async fn duplicate_cluster_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let catalog_path = dir.path().join("catalog.yaml");
        let yaml = r#"
clusters:
  - id: 5
    name: one
    environments: []
  - id: 5
    name: two
    environments: []
"#;
        tokio::fs::write(&catalog_path, yaml).await.unwrap();

        let err = YamlCatalog::load(&catalog_path, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateCluster(5)));
    }
}
