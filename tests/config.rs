//! Config store: validation boundaries, YAML round-trips, and the advisory
//! lock path.

use dotlocal::config::{
    self, validate_domain, validate_hostname, validate_port, validate_route, Config, Domain,
    LogMode, Route,
};
use dotlocal::paths::Paths;
use tempfile::TempDir;

fn temp_paths() -> (TempDir, Paths) {
    let dir = TempDir::new().unwrap();
    let paths = Paths::new(dir.path());
    (dir, paths)
}

#[test]
fn hostname_length_boundaries() {
    let max = "a".repeat(63);
    assert!(validate_hostname(&max).is_ok());

    let too_long = "a".repeat(64);
    assert!(validate_hostname(&too_long).is_err());

    assert!(validate_hostname("").is_err());
}

#[test]
fn hostname_character_rules() {
    assert!(validate_hostname("myapp").is_ok());
    assert!(validate_hostname("my-app-2").is_ok());
    assert!(validate_hostname("a").is_ok());

    assert!(validate_hostname("MyApp").is_err());
    assert!(validate_hostname("-app").is_err());
    assert!(validate_hostname("app-").is_err());
    assert!(validate_hostname("my.app").is_err());
    assert!(validate_hostname("my_app").is_err());
}

#[test]
fn port_boundaries() {
    assert!(validate_port(0).is_err());
    assert!(validate_port(-1).is_err());
    assert!(validate_port(65536).is_err());
    assert_eq!(validate_port(1).unwrap(), 1);
    assert_eq!(validate_port(65535).unwrap(), 65535);
}

#[test]
fn route_paths_must_be_absolute() {
    assert!(validate_route("/api", 8080).is_ok());
    assert!(validate_route("api", 8080).is_err());
    assert!(validate_route("", 8080).is_err());
}

#[test]
fn domain_validation_combines_name_and_port() {
    assert!(validate_domain("myapp", 3000).is_ok());
    assert!(validate_domain("MyApp", 3000).is_err());
}

#[test]
fn log_mode_parsing() {
    assert_eq!(LogMode::parse("full").unwrap(), LogMode::Full);
    assert_eq!(LogMode::parse("minimal").unwrap(), LogMode::Minimal);
    assert_eq!(LogMode::parse("off").unwrap(), LogMode::Off);
    assert_eq!(LogMode::parse("").unwrap(), LogMode::Full);
    assert_eq!(LogMode::parse(" FULL ").unwrap(), LogMode::Full);
    assert!(LogMode::parse("verbose").is_err());
}

#[test]
fn load_missing_file_is_empty_config() {
    let (_dir, paths) = temp_paths();
    let cfg = Config::load(&paths).unwrap();
    assert!(cfg.domains.is_empty());
    assert_eq!(cfg.log_mode, LogMode::Full);
}

#[test]
fn save_and_load_round_trip() {
    let (_dir, paths) = temp_paths();

    let mut cfg = Config::default();
    cfg.set_domain(
        "myapp",
        3000,
        vec![Route {
            path: "/api".to_owned(),
            port: 8080,
        }],
    )
    .unwrap();
    cfg.set_domain("api", 8080, vec![]).unwrap();
    cfg.log_mode = LogMode::Minimal;
    cfg.save(&paths).unwrap();

    let loaded = Config::load(&paths).unwrap();
    assert_eq!(loaded, cfg);
}

#[test]
fn parses_human_written_yaml() {
    let yaml = r#"
domains:
  - name: myapp
    port: 3000
    routes:
      - path: /api
        port: 8080
  - name: api
    port: 9090
log_mode: minimal
"#;
    let cfg: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(cfg.domains.len(), 2);
    assert_eq!(cfg.domains[0].name, "myapp");
    assert_eq!(cfg.domains[0].routes[0].path, "/api");
    assert_eq!(cfg.log_mode, LogMode::Minimal);
    assert!(cfg.validate().is_ok());
}

#[test]
fn out_of_range_yaml_port_is_rejected() {
    let yaml = "domains:\n  - name: myapp\n    port: 65536\n";
    assert!(serde_yaml::from_str::<Config>(yaml).is_err());
}

#[test]
fn validate_rejects_duplicates_and_bad_entries() {
    let cfg = Config {
        domains: vec![
            Domain {
                name: "myapp".to_owned(),
                port: 3000,
                routes: vec![],
            },
            Domain {
                name: "myapp".to_owned(),
                port: 4000,
                routes: vec![],
            },
        ],
        log_mode: LogMode::Full,
    };
    assert!(cfg.validate().is_err());

    let cfg = Config {
        domains: vec![Domain {
            name: "myapp".to_owned(),
            port: 3000,
            routes: vec![Route {
                path: "api".to_owned(),
                port: 8080,
            }],
        }],
        log_mode: LogMode::Full,
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn set_domain_updates_in_place() {
    let mut cfg = Config::default();
    cfg.set_domain("myapp", 3000, vec![]).unwrap();
    cfg.set_domain("myapp", 4000, vec![]).unwrap();

    assert_eq!(cfg.domains.len(), 1);
    assert_eq!(cfg.find_domain("myapp").unwrap().port, 4000);
}

#[test]
fn set_domain_rejects_invalid_input() {
    let mut cfg = Config::default();
    assert!(cfg.set_domain("Bad Name", 3000, vec![]).is_err());
    assert!(cfg.domains.is_empty());
}

#[test]
fn add_then_remove_leaves_config_unchanged() {
    let (_dir, paths) = temp_paths();

    let mut cfg = Config::default();
    cfg.set_domain("api", 8080, vec![]).unwrap();
    cfg.save(&paths).unwrap();
    let before = Config::load(&paths).unwrap();

    let mut cfg = Config::load(&paths).unwrap();
    cfg.set_domain("myapp", 3000, vec![]).unwrap();
    cfg.save(&paths).unwrap();

    let mut cfg = Config::load(&paths).unwrap();
    cfg.remove_domain("myapp").unwrap();
    cfg.save(&paths).unwrap();

    assert_eq!(Config::load(&paths).unwrap(), before);
    assert!(cfg.remove_domain("myapp").is_err());
}

#[test]
fn with_lock_serializes_read_modify_write() {
    let (_dir, paths) = temp_paths();

    config::with_lock(&paths, || {
        let mut cfg = Config::load(&paths)?;
        cfg.set_domain("myapp", 3000, vec![])?;
        cfg.save(&paths)
    })
    .unwrap();

    let cfg = Config::load(&paths).unwrap();
    assert_eq!(cfg.find_domain("myapp").unwrap().port, 3000);
    assert!(paths.config_lock().exists());
}
