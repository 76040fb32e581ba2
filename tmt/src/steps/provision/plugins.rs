//! Provision methods: each turns one phase into an unstarted [`Guest`].

use std::path::Path;

use anyhow::{Result, anyhow};
use serde_yaml::Value;

use crate::error::specification;
use crate::guest::{
    ArtemisGuest, ContainerGuest, Guest, GuestCommon, LocalGuest, MinuteGuest, SshGuest, SshTransport,
    VirtualGuest,
};
use crate::steps::{PlanContext, PluginData};

pub const ARTEMIS_URL_ENV: &str = "ARTEMIS_API_URL";
pub const ARTEMIS_VERSION_ENV: &str = "ARTEMIS_API_VERSION";

/// Build a guest for `data`; `instance_dir` is the guest's private directory.
pub type ProvisionFactory = fn(&PluginData, &PlanContext, &Path) -> Result<Guest>;

pub const LOCAL_SCHEMA: &str = crate::phase_schema!(
    r#",
    "role": {"type": "string"}"#
);

pub const CONTAINER_SCHEMA: &str = crate::phase_schema!(
    r#",
    "role": {"type": "string"},
    "image": {"type": "string"},
    "pull": {"type": "boolean"},
    "user": {"type": "string"}"#
);

pub const CONNECT_SCHEMA: &str = crate::phase_schema!(
    r#",
    "role": {"type": "string"},
    "guest": {"type": "string"},
    "user": {"type": "string"},
    "port": {"type": "integer"},
    "key": {"type": "string"},
    "password": {"type": "string"}"#
);

pub const VIRTUAL_SCHEMA: &str = crate::phase_schema!(
    r#",
    "role": {"type": "string"},
    "image": {"type": "string"},
    "memory": {"type": "integer"},
    "disk": {"type": "integer"},
    "user": {"type": "string"}"#
);

pub const ARTEMIS_SCHEMA: &str = crate::phase_schema!(
    r#",
    "role": {"type": "string"},
    "api-url": {"type": "string"},
    "api-version": {"type": "string"},
    "arch": {"type": "string"},
    "image": {"type": "string"},
    "pool": {"type": "string"},
    "priority-group": {"type": "string"},
    "keyname": {"type": "string"},
    "user-data": {"type": "object"},
    "provision-timeout": {"type": "integer"},
    "provision-tick": {"type": "integer"},
    "user": {"type": "string"}"#
);

pub const MINUTE_SCHEMA: &str = crate::phase_schema!(
    r#",
    "role": {"type": "string"},
    "api-url": {"type": "string"},
    "image": {"type": "string"},
    "flavor": {"type": "string"}"#
);

fn common(data: &PluginData) -> GuestCommon {
    GuestCommon::new(data.name.clone(), data.get_str("role"))
}

fn required(data: &PluginData, key: &str) -> Result<String> {
    data.get_str(key).ok_or_else(|| {
        specification(format!(
            "provision phase '{}' (how: {}) requires '{key}'",
            data.name, data.how
        ))
    })
}

pub fn local(data: &PluginData, _ctx: &PlanContext, _instance_dir: &Path) -> Result<Guest> {
    Ok(Guest::Local(LocalGuest::new(common(data))))
}

pub fn container(data: &PluginData, _ctx: &PlanContext, _instance_dir: &Path) -> Result<Guest> {
    let image = data.get_str("image").unwrap_or_else(|| "fedora".to_string());
    Ok(Guest::Container(ContainerGuest::new(
        common(data),
        image,
        data.get_bool("pull"),
        data.get_str("user"),
    )))
}

pub fn connect(data: &PluginData, _ctx: &PlanContext, _instance_dir: &Path) -> Result<Guest> {
    let host = required(data, "guest")?;
    let mut transport = SshTransport::new(host, data.get_str("user").unwrap_or_else(|| "root".to_string()));
    transport.port = data
        .get_u64("port")
        .map(|port| u16::try_from(port).map_err(|_| anyhow!("invalid port {port}")))
        .transpose()?;
    transport.key = data.get_str("key").map(Into::into);
    transport.password = data.get_str("password");
    Ok(Guest::Connect(SshGuest::new(common(data), transport)))
}

pub fn virtual_machine(data: &PluginData, ctx: &PlanContext, instance_dir: &Path) -> Result<Guest> {
    let defaults = &ctx.config.virtual_machine;
    let mut guest = VirtualGuest::new(
        common(data),
        data.get_str("image").unwrap_or_else(|| defaults.image.clone()),
        data.get_u64("memory").unwrap_or(defaults.memory),
        data.get_u64("disk").unwrap_or(defaults.disk),
        instance_dir.to_path_buf(),
    );
    if let Some(user) = data.get_str("user") {
        guest.transport.user = user;
    }
    Ok(Guest::Virtual(guest))
}

/// Artemis API URL: phase key, then `ARTEMIS_API_URL`, then tool config.
fn artemis_url(data: &PluginData, ctx: &PlanContext, env_url: Option<String>) -> Result<String> {
    data.get_str("api-url")
        .or(env_url)
        .or_else(|| ctx.config.artemis.api_url.clone())
        .ok_or_else(|| {
            specification(format!(
                "provision phase '{}' needs 'api-url' or {ARTEMIS_URL_ENV}",
                data.name
            ))
        })
}

pub fn artemis(data: &PluginData, ctx: &PlanContext, _instance_dir: &Path) -> Result<Guest> {
    let config = &ctx.config.artemis;
    let api_url = artemis_url(data, ctx, std::env::var(ARTEMIS_URL_ENV).ok())?;
    let api_version = data
        .get_str("api-version")
        .or_else(|| std::env::var(ARTEMIS_VERSION_ENV).ok())
        .unwrap_or_else(|| config.api_version.clone());
    let user_data = match data.get("user-data") {
        Some(Value::Mapping(map)) => map
            .iter()
            .filter_map(|(key, value)| {
                let key = key.as_str()?.to_string();
                let value = crate::core::environment::scalar_to_string(value).ok()?;
                Some((key, value))
            })
            .collect(),
        _ => Default::default(),
    };
    Ok(Guest::Artemis(ArtemisGuest {
        common: common(data),
        api_url,
        api_version,
        guestname: None,
        arch: data.get_str("arch").unwrap_or_else(|| "x86_64".to_string()),
        image: required(data, "image")?,
        pool: data.get_str("pool"),
        priority_group: data
            .get_str("priority-group")
            .unwrap_or_else(|| "default-priority".to_string()),
        keyname: data.get_str("keyname").unwrap_or_else(|| "default".to_string()),
        user_data,
        provision_timeout: data.get_u64("provision-timeout").unwrap_or(config.timeout_secs),
        provision_tick: data.get_u64("provision-tick").unwrap_or(config.tick_secs),
        transport: SshTransport::new("", data.get_str("user").unwrap_or_else(|| "root".to_string())),
    }))
}

pub fn minute(data: &PluginData, _ctx: &PlanContext, _instance_dir: &Path) -> Result<Guest> {
    Ok(Guest::Minute(MinuteGuest::new(
        common(data),
        required(data, "api-url")?,
        data.get_str("image").unwrap_or_else(|| "fedora".to_string()),
        data.get_str("flavor").unwrap_or_else(|| "m1.small".to_string()),
    )))
}
