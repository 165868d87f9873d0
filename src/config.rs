//! Process configuration, from command line flags or a YAML file.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use libbpf_sys::{XDP_FLAGS_DRV_MODE, XDP_FLAGS_SKB_MODE, XDP_FLAGS_UPDATE_IF_NOEXIST};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::socket::SocketOptions;
use crate::util::is_pow_of_two;
use crate::RX_BATCH_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {0}: {1}")]
    Read(PathBuf, #[source] io::Error),
    #[error("parsing {0}: {1}")]
    Parse(PathBuf, #[source] serde_yaml::Error),
    #[error("an interface name is required")]
    MissingInterface,
    #[error("{0} must be a power of two, got {1}")]
    NotPowerOfTwo(&'static str, u64),
    #[error("batch size {0} is outside 1..={}", RX_BATCH_SIZE)]
    BatchSize(usize),
    #[error("frame size {0} is too small for a packet")]
    FrameSize(usize),
    #[error("copy mode and zero-copy mode are mutually exclusive")]
    CopyAndZeroCopy,
    #[error("unknown XDP mode {0:?}, expected generic, native or auto")]
    XdpMode(String),
}

/// How the XDP program is attached.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    /// SKB mode, works on every driver.
    Generic,
    /// Driver mode.
    Native,
    /// Let the kernel pick.
    Auto,
}

impl Default for XdpMode {
    fn default() -> Self {
        XdpMode::Auto
    }
}

impl FromStr for XdpMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generic" | "skb" => Ok(XdpMode::Generic),
            "native" | "drv" => Ok(XdpMode::Native),
            "auto" => Ok(XdpMode::Auto),
            _ => Err(ConfigError::XdpMode(s.to_string())),
        }
    }
}

/// Where and what to subscribe to on the control plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub group: String,
    pub neighbor_table: String,
    pub security_group_rules_table: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            server_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_port: 9090,
            group: String::from("group1"),
            neighbor_table: String::from("NeighborRule"),
            security_group_rules_table: String::from("SecurityGroupRule"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub ifname: String,
    pub xdp_mode: XdpMode,
    pub queue: usize,
    /// Sleep in poll(2) when idle instead of busy polling.
    pub poll_mode: bool,
    pub batch_size: usize,
    /// Replace an XDP program that is already attached.
    pub force: bool,
    pub copy_mode: bool,
    pub zero_copy: bool,
    /// Custom XDP object. libbpf's default redirect program is used when unset.
    pub filename: Option<PathBuf>,
    pub progsec: String,
    /// Detach the XDP program from the interface and exit.
    pub unload: bool,
    pub frame_count: usize,
    pub frame_size: usize,
    pub ring_size: u32,
    pub huge_tlb: bool,
    pub sync: Option<SyncConfig>,
    /// Pinned kernel map receiving neighbor entries.
    pub neighbor_map: Option<PathBuf>,
    /// Pinned kernel map receiving security group rules.
    pub security_group_map: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ifname: String::new(),
            xdp_mode: XdpMode::Auto,
            queue: 0,
            poll_mode: false,
            batch_size: RX_BATCH_SIZE,
            force: false,
            copy_mode: false,
            zero_copy: false,
            filename: None,
            progsec: String::from("xdp_sock"),
            unload: false,
            frame_count: 4096,
            frame_size: 4096,
            ring_size: 2048,
            huge_tlb: false,
            sync: None,
            neighbor_map: None,
            security_group_map: None,
        }
    }
}

impl Config {
    pub fn from_yaml_file(path: &Path) -> Result<Config, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ifname.is_empty() {
            return Err(ConfigError::MissingInterface);
        }
        if self.unload {
            return Ok(());
        }
        if !is_pow_of_two(self.ring_size as u64) {
            return Err(ConfigError::NotPowerOfTwo("ring size", self.ring_size as u64));
        }
        if !is_pow_of_two(self.frame_size as u64) {
            return Err(ConfigError::NotPowerOfTwo("frame size", self.frame_size as u64));
        }
        if self.frame_size < 2048 {
            return Err(ConfigError::FrameSize(self.frame_size));
        }
        if self.batch_size == 0 || self.batch_size > RX_BATCH_SIZE {
            return Err(ConfigError::BatchSize(self.batch_size));
        }
        if self.copy_mode && self.zero_copy {
            return Err(ConfigError::CopyAndZeroCopy);
        }
        Ok(())
    }

    /// XDP_FLAGS_* for attaching and detaching the program.
    pub fn xdp_flags(&self) -> u32 {
        let mut flags = match self.xdp_mode {
            XdpMode::Generic => XDP_FLAGS_SKB_MODE,
            XdpMode::Native => XDP_FLAGS_DRV_MODE,
            XdpMode::Auto => 0,
        };
        if !self.force {
            flags |= XDP_FLAGS_UPDATE_IF_NOEXIST;
        }
        flags
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            zero_copy_mode: self.zero_copy,
            copy_mode: self.copy_mode,
            xdp_flags: self.xdp_flags(),
            inhibit_prog_load: self.filename.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            ifname: String::from("veth0"),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_validate() {
        valid().validate().unwrap();
        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::MissingInterface)
        ));
    }

    #[test]
    fn rejects_bad_sizes() {
        let c = Config {
            ring_size: 1000,
            ..valid()
        };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::NotPowerOfTwo("ring size", 1000))
        ));

        let c = Config {
            batch_size: 0,
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::BatchSize(0))));

        let c = Config {
            batch_size: RX_BATCH_SIZE + 1,
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::BatchSize(_))));

        let c = Config {
            frame_size: 1024,
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::FrameSize(1024))));
    }

    #[test]
    fn copy_modes_exclusive() {
        let c = Config {
            copy_mode: true,
            zero_copy: true,
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::CopyAndZeroCopy)));
    }

    #[test]
    fn unload_skips_dataplane_checks() {
        let c = Config {
            unload: true,
            ring_size: 3,
            ..valid()
        };
        c.validate().unwrap();
    }

    #[test]
    fn flags_follow_mode_and_force() {
        let c = Config {
            xdp_mode: XdpMode::Native,
            ..valid()
        };
        assert_eq!(c.xdp_flags(), XDP_FLAGS_DRV_MODE | XDP_FLAGS_UPDATE_IF_NOEXIST);

        let c = Config {
            xdp_mode: XdpMode::Generic,
            force: true,
            ..valid()
        };
        assert_eq!(c.xdp_flags(), XDP_FLAGS_SKB_MODE);

        assert_eq!(valid().xdp_flags(), XDP_FLAGS_UPDATE_IF_NOEXIST);
    }

    #[test]
    fn custom_program_inhibits_default_load() {
        let c = Config {
            filename: Some(PathBuf::from("af_xdp_kern.o")),
            zero_copy: true,
            ..valid()
        };
        let o = c.socket_options();
        assert!(o.inhibit_prog_load);
        assert!(o.zero_copy_mode);
        assert!(!o.copy_mode);
    }

    #[test]
    fn mode_names() {
        assert_eq!("skb".parse::<XdpMode>().unwrap(), XdpMode::Generic);
        assert_eq!("native".parse::<XdpMode>().unwrap(), XdpMode::Native);
        assert!("hw".parse::<XdpMode>().is_err());
    }

    #[test]
    fn yaml() {
        let yaml = r#"
ifname: eth1
xdp_mode: native
queue: 3
batch_size: 32
sync:
  server_ip: 10.213.43.2
  group: group7
neighbor_map: /sys/fs/bpf/endpoints_map
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.ifname, "eth1");
        assert_eq!(c.xdp_mode, XdpMode::Native);
        assert_eq!(c.queue, 3);
        assert_eq!(c.batch_size, 32);
        assert_eq!(c.ring_size, 2048);
        let sync = c.sync.unwrap();
        assert_eq!(sync.server_ip, "10.213.43.2".parse::<IpAddr>().unwrap());
        assert_eq!(sync.server_port, 9090);
        assert_eq!(sync.group, "group7");
        assert_eq!(sync.neighbor_table, "NeighborRule");
        assert_eq!(
            c.neighbor_map,
            Some(PathBuf::from("/sys/fs/bpf/endpoints_map"))
        );

        assert!(serde_yaml::from_str::<Config>("ifname: eth1\nbogus: 1\n").is_err());
    }
}
