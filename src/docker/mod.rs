//! Thin semantic wrapper over the container engine.
//!
//! The gateway owns no state and caches no object ids: repairs and external
//! actors may recreate objects out of band, so every call goes back to the
//! engine. `ensure_*` operations are idempotent; an object with the same
//! name but incompatible configuration fails with
//! [`RunnerError::Conflict`].

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, EndpointSettings, Ipam, IpamConfig, Network};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, ListNetworksOptions,
};
use bollard::Docker;
use futures_util::{Stream, StreamExt};

use crate::error::{is_image_not_found, RunnerError};

/// Deadline for network attach/detach/remove calls.
pub const NETWORK_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect to the local engine and verify it is reachable.
pub async fn connect() -> Result<Docker, RunnerError> {
    let docker = Docker::connect_with_local_defaults()
        .map_err(|e| RunnerError::EngineUnavailable(e.to_string()))?;
    docker
        .ping()
        .await
        .map_err(|e| RunnerError::EngineUnavailable(e.to_string()))?;
    Ok(docker)
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

async fn with_deadline<T, F>(fut: F) -> Result<T, RunnerError>
where
    F: std::future::Future<Output = Result<T, RunnerError>>,
{
    match tokio::time::timeout(NETWORK_OP_TIMEOUT, fut).await {
        Ok(res) => res,
        Err(_) => Err(RunnerError::Cancelled),
    }
}

/// List networks carrying `label_key=label_value`.
pub async fn list_networks(
    docker: &Docker,
    label_key: &str,
    label_value: &str,
) -> Result<Vec<Network>, RunnerError> {
    let mut filters = HashMap::new();
    filters.insert(
        "label".to_string(),
        vec![format!("{label_key}={label_value}")],
    );
    docker
        .list_networks(Some(ListNetworksOptions { filters }))
        .await
        .map_err(|e| RunnerError::engine("network list", format!("{label_key}={label_value}"), e))
}

/// Return the bridge networks whose name is exactly `name`.
///
/// The engine's name filter matches substrings, so the result is filtered
/// down to exact matches.
pub async fn check_bridge_network(docker: &Docker, name: &str) -> Result<Vec<Network>, RunnerError> {
    let mut filters = HashMap::new();
    filters.insert("name".to_string(), vec![name.to_string()]);
    filters.insert("driver".to_string(), vec!["bridge".to_string()]);
    let networks = docker
        .list_networks(Some(ListNetworksOptions { filters }))
        .await
        .map_err(|e| RunnerError::engine("network list", name, e))?;
    Ok(networks
        .into_iter()
        .filter(|n| n.name.as_deref() == Some(name))
        .collect())
}

/// Create a bridge network, failing if the name is already taken.
pub async fn new_bridge_network(
    docker: &Docker,
    name: &str,
    internal: bool,
    labels: HashMap<String, String>,
    subnet: &str,
    gateway: &str,
) -> Result<String, RunnerError> {
    let options = CreateNetworkOptions {
        name: name.to_string(),
        check_duplicate: true,
        driver: "bridge".to_string(),
        internal,
        ipam: Ipam {
            driver: Some("default".to_string()),
            config: Some(vec![IpamConfig {
                subnet: Some(subnet.to_string()),
                gateway: Some(gateway.to_string()),
                ..Default::default()
            }]),
            options: None,
        },
        labels,
        ..Default::default()
    };
    docker
        .create_network(options)
        .await
        .map_err(|e| RunnerError::engine("network create", name, e))?;

    // Resolve the id by inspecting: create responses omit it on some
    // engine versions.
    let inspected = docker
        .inspect_network::<String>(name, None)
        .await
        .map_err(|e| RunnerError::engine("network inspect", name, e))?;
    inspected.id.ok_or_else(|| RunnerError::Engine {
        op: "network create",
        object: name.to_string(),
        message: "engine returned no network id".to_string(),
    })
}

/// Return the id of the named bridge network, creating it if absent.
pub async fn ensure_bridge_network(
    docker: &Docker,
    name: &str,
    internal: bool,
    subnet: &str,
    gateway: &str,
) -> Result<String, RunnerError> {
    let existing = check_bridge_network(docker, name).await?;
    if let Some(network) = existing.into_iter().next() {
        verify_network_compatible(name, internal, subnet, &network)?;
        return network.id.ok_or_else(|| RunnerError::Engine {
            op: "network inspect",
            object: name.to_string(),
            message: "engine returned no network id".to_string(),
        });
    }
    new_bridge_network(docker, name, internal, HashMap::new(), subnet, gateway).await
}

fn verify_network_compatible(
    name: &str,
    internal: bool,
    subnet: &str,
    network: &Network,
) -> Result<(), RunnerError> {
    if network.internal.unwrap_or(false) != internal {
        return Err(RunnerError::Conflict {
            object: format!("network {name}"),
            detail: format!("internal flag differs (want {internal})"),
        });
    }
    let existing_subnet = network
        .ipam
        .as_ref()
        .and_then(|ipam| ipam.config.as_ref())
        .and_then(|cfgs| cfgs.first())
        .and_then(|cfg| cfg.subnet.as_deref());
    if let Some(existing) = existing_subnet {
        if existing != subnet {
            return Err(RunnerError::Conflict {
                object: format!("network {name}"),
                detail: format!("subnet {existing} differs from requested {subnet}"),
            });
        }
    }
    Ok(())
}

/// Remove a network under the standard deadline.
pub async fn remove_network(docker: &Docker, id: &str) -> Result<(), RunnerError> {
    with_deadline(async {
        docker
            .remove_network(id)
            .await
            .map_err(|e| RunnerError::engine("network remove", id, e))
    })
    .await
}

/// Attach a container to a network as an additional interface.
pub async fn attach_to_network(
    docker: &Docker,
    container_id: &str,
    network_id: &str,
) -> Result<(), RunnerError> {
    with_deadline(async {
        docker
            .connect_network(
                network_id,
                ConnectNetworkOptions {
                    container: container_id.to_string(),
                    endpoint_config: EndpointSettings::default(),
                },
            )
            .await
            .map_err(|e| RunnerError::engine("network connect", container_id, e))
    })
    .await
}

/// Detach a container from a network.
pub async fn detach_from_network(
    docker: &Docker,
    container_id: &str,
    network_id: &str,
) -> Result<(), RunnerError> {
    with_deadline(async {
        docker
            .disconnect_network(
                network_id,
                DisconnectNetworkOptions {
                    container: container_id.to_string(),
                    force: true,
                },
            )
            .await
            .map_err(|e| RunnerError::engine("network disconnect", container_id, e))
    })
    .await
}

/// Inspect a container by name; `None` when it does not exist.
pub async fn check_container(
    docker: &Docker,
    name: &str,
) -> Result<Option<ContainerInspectResponse>, RunnerError> {
    match docker
        .inspect_container(name, None::<InspectContainerOptions>)
        .await
    {
        Ok(info) => Ok(Some(info)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(RunnerError::engine("container inspect", name, e)),
    }
}

/// Whether the image is present locally.
pub async fn image_present(docker: &Docker, image: &str) -> Result<bool, RunnerError> {
    match docker.inspect_image(image).await {
        Ok(_) => Ok(true),
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(RunnerError::engine("image inspect", image, e)),
    }
}

/// Pull an image from its registry, draining the progress stream.
pub async fn pull_image(docker: &Docker, image: &str) -> Result<(), RunnerError> {
    tracing::info!(image, "pulling image");
    let options = CreateImageOptions {
        from_image: image.to_string(),
        ..Default::default()
    };
    let mut progress = docker.create_image(Some(options), None, None);
    while let Some(step) = progress.next().await {
        step.map_err(|e| RunnerError::engine("image pull", image, e))?;
    }
    Ok(())
}

/// Create a container, classifying a missing image as
/// [`RunnerError::ImageNotFound`].
pub async fn create_container(
    docker: &Docker,
    name: &str,
    config: Config<String>,
) -> Result<String, RunnerError> {
    let image = config.image.clone().unwrap_or_default();
    let options = CreateContainerOptions {
        name: name.to_string(),
        ..Default::default()
    };
    match docker.create_container(Some(options), config).await {
        Ok(response) => Ok(response.id),
        Err(e) if is_image_not_found(&e) => Err(RunnerError::ImageNotFound { image }),
        Err(e) => Err(RunnerError::engine("container create", name, e)),
    }
}

/// Start a created container.
pub async fn start_container(docker: &Docker, id: &str) -> Result<(), RunnerError> {
    docker
        .start_container(id, None::<StartContainerOptions<String>>)
        .await
        .map_err(|e| RunnerError::engine("container start", id, e))
}

/// Force-remove a container.
pub async fn remove_container(docker: &Docker, id: &str, force: bool) -> Result<(), RunnerError> {
    with_deadline(async {
        docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| RunnerError::engine("container remove", id, e))
    })
    .await
}

/// Options for [`ensure_container`].
pub struct EnsureContainerOpts {
    pub name: String,
    pub config: Config<String>,
    /// When true and the image is absent locally, pull it. When false a
    /// missing image fails with [`RunnerError::ImageNotFound`].
    pub pull_image_if_missing: bool,
}

/// Return the id of the named container, creating and starting it if
/// absent, starting it if stopped.
pub async fn ensure_container(
    docker: &Docker,
    opts: EnsureContainerOpts,
) -> Result<String, RunnerError> {
    let name = opts.name.as_str();
    if let Some(existing) = check_container(docker, name).await? {
        verify_container_compatible(name, &opts.config, &existing)?;
        let id = existing.id.unwrap_or_else(|| name.to_string());
        let running = existing
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            tracing::info!(container = name, "starting existing container");
            start_container(docker, &id).await?;
        }
        return Ok(id);
    }

    let image = opts.config.image.clone().unwrap_or_default();
    if !image_present(docker, &image).await? {
        if opts.pull_image_if_missing {
            pull_image(docker, &image).await?;
        } else {
            return Err(RunnerError::ImageNotFound { image });
        }
    }

    tracing::info!(container = name, image = %image, "creating container");
    let id = create_container(docker, name, opts.config).await?;
    start_container(docker, &id).await?;
    Ok(id)
}

fn verify_container_compatible(
    name: &str,
    wanted: &Config<String>,
    existing: &ContainerInspectResponse,
) -> Result<(), RunnerError> {
    let existing_image = existing
        .config
        .as_ref()
        .and_then(|c| c.image.as_deref())
        .unwrap_or_default();
    if let Some(wanted_image) = wanted.image.as_deref() {
        if existing_image != wanted_image {
            return Err(RunnerError::Conflict {
                object: format!("container {name}"),
                detail: format!("image {existing_image} differs from requested {wanted_image}"),
            });
        }
    }
    if let Some(wanted_entrypoint) = wanted.entrypoint.as_ref() {
        let existing_entrypoint = existing
            .config
            .as_ref()
            .and_then(|c| c.entrypoint.clone())
            .unwrap_or_default();
        if &existing_entrypoint != wanted_entrypoint {
            return Err(RunnerError::Conflict {
                object: format!("container {name}"),
                detail: format!(
                    "entrypoint {existing_entrypoint:?} differs from requested {wanted_entrypoint:?}"
                ),
            });
        }
    }
    Ok(())
}

/// The container's combined log stream, framed into stdout/stderr chunks.
pub fn container_logs(
    docker: &Docker,
    id: &str,
    follow: bool,
) -> impl Stream<Item = Result<LogOutput, bollard::errors::Error>> {
    docker.logs(
        id,
        Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            since: 0,
            ..Default::default()
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_with(internal: bool, subnet: Option<&str>) -> Network {
        Network {
            name: Some("testground-control".to_string()),
            id: Some("abc".to_string()),
            internal: Some(internal),
            ipam: subnet.map(|s| Ipam {
                driver: Some("default".to_string()),
                config: Some(vec![IpamConfig {
                    subnet: Some(s.to_string()),
                    ..Default::default()
                }]),
                options: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn compatible_network_passes() {
        let network = network_with(true, Some("192.18.0.0/16"));
        assert!(
            verify_network_compatible("testground-control", true, "192.18.0.0/16", &network)
                .is_ok()
        );
    }

    #[test]
    fn network_subnet_mismatch_is_conflict() {
        let network = network_with(true, Some("10.1.0.0/16"));
        let err = verify_network_compatible("testground-control", true, "192.18.0.0/16", &network)
            .unwrap_err();
        assert!(matches!(err, RunnerError::Conflict { .. }));
    }

    #[test]
    fn network_internal_mismatch_is_conflict() {
        let network = network_with(false, Some("192.18.0.0/16"));
        let err = verify_network_compatible("testground-control", true, "192.18.0.0/16", &network)
            .unwrap_err();
        assert!(matches!(err, RunnerError::Conflict { .. }));
    }

    #[test]
    fn container_image_mismatch_is_conflict() {
        let wanted = Config::<String> {
            image: Some("redis".to_string()),
            ..Default::default()
        };
        let existing = ContainerInspectResponse {
            config: Some(bollard::models::ContainerConfig {
                image: Some("memcached".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = verify_container_compatible("testground-redis", &wanted, &existing).unwrap_err();
        assert!(matches!(err, RunnerError::Conflict { .. }));
    }

    #[test]
    fn container_same_image_passes() {
        let wanted = Config::<String> {
            image: Some("redis".to_string()),
            entrypoint: Some(vec!["redis-server".to_string()]),
            ..Default::default()
        };
        let existing = ContainerInspectResponse {
            config: Some(bollard::models::ContainerConfig {
                image: Some("redis".to_string()),
                entrypoint: Some(vec!["redis-server".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(verify_container_compatible("testground-redis", &wanted, &existing).is_ok());
    }
}
