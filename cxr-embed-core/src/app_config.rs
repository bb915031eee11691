use std::{fs, sync::LazyLock};

use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigError, File};

use crate::embeddings::EndpointConfig;
use crate::prediction::EndpointDescriptor;

/// Loads the deployed-model endpoint table from the endpoints configuration
/// file, creating the file from bundled defaults on first use.
///
/// The file holds the hosting project, the serving location, and the numeric
/// endpoint id of every model stage. Callers typically override the project
/// (and the single-stage endpoint id) from CLI flags afterwards.
///
/// # Panics
///
/// Panics if the endpoints configuration cannot be loaded or any of the
/// required settings are missing.
pub fn get_endpoint_config() -> EndpointConfig {
    let endpoints_config = get_endpoints_config_file().expect("Failed to load endpoints config");

    let project = endpoints_config
        .get_string("project")
        .expect("Failed to get project from endpoints config");
    let location = endpoints_config
        .get_string("location")
        .expect("Failed to get location from endpoints config");

    let descriptor = |key: &str| EndpointDescriptor {
        project: project.clone(),
        location: location.clone(),
        endpoint_id: endpoints_config
            .get_int(key)
            .unwrap_or_else(|_| panic!("Failed to get {key} from endpoints config"))
            as u64,
    };

    EndpointConfig {
        v1: descriptor("endpoints.v1"),
        v2_stage_c: descriptor("endpoints.v2_stage_c"),
        v2_stage_b: descriptor("endpoints.v2_stage_b"),
    }
}

/// Bearer token for the prediction service, taken from the environment.
pub fn get_access_token() -> Option<String> {
    std::env::var("CXR_EMBED_ACCESS_TOKEN").ok()
}

// Private constants and functions

const DEFAULT_ENDPOINTS_CONFIG_BYTES: &[u8] = include_bytes!("../artifacts/defaults/endpoints.toml");

fn get_endpoints_config_file() -> Result<Config, ConfigError> {
    let config_file_path = get_app_folder().join("endpoints.toml");
    if !fs::exists(&config_file_path).expect("Error while checking if endpoints config file exists") {
        // If the endpoints.toml file does not exist, create it with default values
        fs::write(&config_file_path, DEFAULT_ENDPOINTS_CONFIG_BYTES)
            .expect("Failed to create default endpoints.toml");
    }

    Config::builder()
        .add_source(File::with_name(config_file_path.as_str()))
        .build()
}

fn get_app_folder() -> &'static Utf8Path {
    let folder: &'static Utf8PathBuf = &APP_FOLDER;
    if !fs::exists(folder).expect("Error while determining if app data directory exists") {
        fs::create_dir_all(folder).expect("Failed to create local data directory");
    }
    folder.as_path()
}

static APP_FOLDER: LazyLock<Utf8PathBuf> = LazyLock::new(|| {
    Utf8PathBuf::from_path_buf(dirs::data_local_dir().expect("Failed to get local data directory"))
        .expect("Local data directory is not a valid UTF-8 path")
        .join("cxr-embed")
});
