//! Structural validation of a parsed configuration.
//!
//! Anything that can fail at runtime but is knowable at startup is checked
//! here: name uniqueness, peer references, transformation chains (glob and
//! regex compilation), and postgres source settings.

use std::collections::HashSet;

use pgfan_core::{compile_chain, Op, TransformSpec};

use crate::error::{ConfigError, ConfigResult};
use crate::model::{Config, PostgresPeerConfig};

pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_peers(config)?;
    validate_pipelines(config)?;
    Ok(())
}

fn validate_peers(config: &Config) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for peer in &config.pipeline.peers {
        if !seen.insert(peer.name.as_str()) {
            return Err(ConfigError::DuplicatePeer(peer.name.clone()));
        }

        if peer.connector == "postgres" {
            let pg = PostgresPeerConfig::from_peer(peer)?;
            if pg.conn_string.is_empty() {
                return Err(ConfigError::InvalidPeerConfig {
                    peer: peer.name.clone(),
                    message: "connString must not be empty".to_string(),
                });
            }
            for op in &pg.replication.ops {
                Op::from_code(op).map_err(|e| ConfigError::InvalidPeerConfig {
                    peer: peer.name.clone(),
                    message: e.to_string(),
                })?;
            }
        }
    }
    Ok(())
}

fn validate_pipelines(config: &Config) -> ConfigResult<()> {
    let peer_names: HashSet<&str> = config
        .pipeline
        .peers
        .iter()
        .map(|p| p.name.as_str())
        .collect();

    let mut seen = HashSet::new();
    for pipeline in &config.pipeline.pipelines {
        if !seen.insert(pipeline.name.as_str()) {
            return Err(ConfigError::DuplicatePipeline(pipeline.name.clone()));
        }

        if pipeline.sources.is_empty() || pipeline.sinks.is_empty() {
            return Err(ConfigError::EmptyPipeline(pipeline.name.clone()));
        }

        for source in &pipeline.sources {
            if !peer_names.contains(source.name.as_str()) {
                return Err(ConfigError::UnknownPeer {
                    pipeline: pipeline.name.clone(),
                    peer: source.name.clone(),
                });
            }
            // v1: only postgres peers act as sources.
            let peer = config.peer(&source.name).expect("checked above");
            if peer.connector != "postgres" {
                return Err(ConfigError::NonPostgresSource {
                    pipeline: pipeline.name.clone(),
                    peer: source.name.clone(),
                });
            }
        }

        validate_chain(
            &pipeline.transformations,
            &format!("pipeline '{}'", pipeline.name),
        )?;

        for sink in &pipeline.sinks {
            if !peer_names.contains(sink.name.as_str()) {
                return Err(ConfigError::UnknownPeer {
                    pipeline: pipeline.name.clone(),
                    peer: sink.name.clone(),
                });
            }
            validate_chain(
                &sink.transformations,
                &format!("pipeline '{}' sink '{}'", pipeline.name, sink.name),
            )?;
        }
    }
    Ok(())
}

fn validate_chain(specs: &[TransformSpec], scope: &str) -> ConfigResult<()> {
    compile_chain(specs)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidTransformation {
            scope: scope.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use crate::error::ConfigError;
    use crate::model::Config;

    #[test]
    fn test_duplicate_peer_name() {
        let yaml = r#"
pipeline:
  peers:
    - name: out
      connector: debug
    - name: out
      connector: debug
"#;
        assert!(matches!(
            Config::parse(yaml),
            Err(ConfigError::DuplicatePeer(_))
        ));
    }

    #[test]
    fn test_unknown_peer_reference() {
        let yaml = r#"
pipeline:
  peers:
    - name: db
      connector: postgres
      config: { connString: "host=localhost" }
  pipelines:
    - name: p
      sources: [{ name: db }]
      sinks: [{ name: nowhere }]
"#;
        assert!(matches!(
            Config::parse(yaml),
            Err(ConfigError::UnknownPeer { .. })
        ));
    }

    #[test]
    fn test_pipeline_without_sinks() {
        let yaml = r#"
pipeline:
  peers:
    - name: db
      connector: postgres
      config: { connString: "host=localhost" }
  pipelines:
    - name: p
      sources: [{ name: db }]
      sinks: []
"#;
        assert!(matches!(
            Config::parse(yaml),
            Err(ConfigError::EmptyPipeline(_))
        ));
    }

    #[test]
    fn test_non_postgres_source_rejected() {
        let yaml = r#"
pipeline:
  peers:
    - name: out
      connector: debug
    - name: sink2
      connector: debug
  pipelines:
    - name: p
      sources: [{ name: out }]
      sinks: [{ name: sink2 }]
"#;
        assert!(matches!(
            Config::parse(yaml),
            Err(ConfigError::NonPostgresSource { .. })
        ));
    }

    #[test]
    fn test_bad_transform_regex_rejected() {
        let yaml = r#"
pipeline:
  peers:
    - name: db
      connector: postgres
      config: { connString: "host=localhost" }
    - name: out
      connector: debug
  pipelines:
    - name: p
      sources: [{ name: db }]
      transformations:
        - type: replace
          tablesRegex: { "([": "x" }
      sinks: [{ name: out }]
"#;
        assert!(matches!(
            Config::parse(yaml),
            Err(ConfigError::InvalidTransformation { .. })
        ));
    }

    #[test]
    fn test_bad_ops_code_rejected() {
        let yaml = r#"
pipeline:
  peers:
    - name: db
      connector: postgres
      config:
        connString: "host=localhost"
        replication:
          ops: ["upsert"]
"#;
        assert!(matches!(
            Config::parse(yaml),
            Err(ConfigError::InvalidPeerConfig { .. })
        ));
    }

    #[test]
    fn test_missing_conn_string_rejected() {
        let yaml = r#"
pipeline:
  peers:
    - name: db
      connector: postgres
      config: {}
"#;
        assert!(matches!(
            Config::parse(yaml),
            Err(ConfigError::InvalidPeerConfig { .. })
        ));
    }
}
