use std::path::PathBuf;

// System layout used when not in dev mode

pub fn system_profiles_dir() -> PathBuf {
    PathBuf::from("/var/lib/kioskface/profiles")
}

pub fn system_ledger_file() -> PathBuf {
    PathBuf::from("/var/lib/kioskface/ledger/detections.jsonl")
}

pub fn system_snapshots_dir() -> PathBuf {
    PathBuf::from("/var/lib/kioskface/snapshots")
}

pub fn system_ledger_key() -> PathBuf {
    PathBuf::from("/var/lib/kioskface/ledger/.key")
}

pub fn system_control_socket() -> PathBuf {
    PathBuf::from("/run/kioskface/control.sock")
}

pub fn system_config_file() -> PathBuf {
    PathBuf::from("/etc/kioskface/kiosk-face.toml")
}

/// Per-user config, tried when the system file is absent.
pub fn user_config_file() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "kioskface", "KioskFace")
        .map(|dirs| dirs.config_dir().join("kiosk-face.toml"))
}
