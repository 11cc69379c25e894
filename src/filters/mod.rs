//! The filter registry and pipeline.
//!
//! Per the Design Notes, dynamic module loading is a non-goal for the
//! rewrite: filters are a static set compiled into this binary. The
//! `infilter_dir`/`outfilter_dir` configuration keys are kept for
//! config-format compatibility but are read as *enable lists* — each entry
//! names one statically registered filter to instantiate, in listed order,
//! for every new Connection Pair.

pub mod bind_rewrite;
pub mod yaml_overlay;

use std::path::PathBuf;

use ldap3_proto::proto::{LdapMsg, LdapSearchResultEntry};

use crate::error::{FilterError, ProxyError};

/// Invoked on every decoded client request before cache lookup and before
/// forwarding. May rewrite any field except `messageID` — the pipeline
/// rejects a filter that changes it.
pub trait InFilter: Send {
    fn name(&self) -> &'static str;
    fn filter(&mut self, req: &mut LdapMsg) -> Result<(), FilterError>;
}

/// Invoked on each `searchResEntry` only — never on `searchResDone`, never
/// on bind/other responses.
pub trait OutFilter: Send {
    fn name(&self) -> &'static str;
    fn filter(&mut self, entry: &mut LdapSearchResultEntry, msgid: i32) -> Result<(), FilterError>;
}

/// Settings the YAML overlay out-filter needs to instantiate itself.
#[derive(Debug, Clone)]
pub struct YamlOverlaySettings {
    pub yaml_dir: PathBuf,
    pub overlay_prefix: String,
}

/// The name the reference bind-DN-rewriting in-filter registers under.
pub const REWRITE_BIND_DN: &str = "rewriteBindDN";
/// The name the reference YAML overlay out-filter registers under.
pub const YAML_OVERLAY: &str = "yamlOverlay";

/// Instantiates one fresh instance of each named in-filter, in order, for a
/// new Connection Pair. Unknown names are logged and skipped.
pub fn build_in_filters(enabled: &[String]) -> Vec<Box<dyn InFilter>> {
    enabled
        .iter()
        .filter_map(|name| match name.as_str() {
            REWRITE_BIND_DN => {
                Some(Box::new(bind_rewrite::RewriteBindDn) as Box<dyn InFilter>)
            }
            other => {
                tracing::warn!(filter = other, "unknown in-filter, skipping");
                None
            }
        })
        .collect()
}

/// Instantiates one fresh instance of each named out-filter, in order, for
/// a new Connection Pair. The YAML overlay filter is only produced when
/// overlay settings are configured.
pub fn build_out_filters(
    enabled: &[String],
    yaml: Option<&YamlOverlaySettings>,
) -> Vec<Box<dyn OutFilter>> {
    enabled
        .iter()
        .filter_map(|name| match name.as_str() {
            YAML_OVERLAY => yaml.map(|cfg| {
                Box::new(yaml_overlay::YamlOverlay::new(
                    cfg.yaml_dir.clone(),
                    cfg.overlay_prefix.clone(),
                )) as Box<dyn OutFilter>
            }),
            other => {
                tracing::warn!(filter = other, "unknown out-filter, skipping");
                None
            }
        })
        .collect()
}

/// Runs every in-filter over `msg` in order. A filter that raises is logged
/// and skipped. When `validate` is set, a filter that mutates `messageID` or
/// whose output fails to re-encode is fatal to the pair
/// (`ProxyError::FilterCorruptedEncoding`); without `validate` neither check
/// runs, per §4.2's scoping of the assertion to `filtervalidate`.
pub fn apply_in_filters(
    filters: &mut [Box<dyn InFilter>],
    msg: &mut LdapMsg,
    validate: bool,
) -> Result<(), ProxyError> {
    for f in filters.iter_mut() {
        let before_msgid = msg.msgid;
        if let Err(e) = f.filter(msg) {
            let raised = ProxyError::FilterRaised(e.0);
            tracing::warn!(filter = f.name(), error = %raised, "message unchanged");
            continue;
        }
        if !validate {
            continue;
        }
        if msg.msgid != before_msgid {
            tracing::error!(filter = f.name(), "in-filter mutated messageID, closing pair");
            return Err(ProxyError::FilterCorruptedEncoding);
        }
        if crate::codec::encode_message(msg.clone()).is_err() {
            tracing::error!(filter = f.name(), "in-filter corrupted message encoding, closing pair");
            return Err(ProxyError::FilterCorruptedEncoding);
        }
    }
    Ok(())
}

/// Runs every out-filter over one `searchResEntry`. Same skip-on-raise,
/// fatal-on-corruption rules as [`apply_in_filters`]; `messageID` is passed
/// read-only here so there is nothing for a filter to mutate.
pub fn apply_out_filters(
    filters: &mut [Box<dyn OutFilter>],
    entry: &mut LdapSearchResultEntry,
    msgid: i32,
    validate: bool,
) -> Result<(), ProxyError> {
    for f in filters.iter_mut() {
        if let Err(e) = f.filter(entry, msgid) {
            let raised = ProxyError::FilterRaised(e.0);
            tracing::warn!(filter = f.name(), error = %raised, "entry unchanged");
            continue;
        }
        if !validate {
            continue;
        }
        let probe = LdapMsg {
            msgid,
            op: ldap3_proto::proto::LdapOp::SearchResultEntry(entry.clone()),
            ctrl: vec![],
        };
        if crate::codec::encode_message(probe).is_err() {
            tracing::error!(filter = f.name(), "out-filter corrupted message encoding, closing pair");
            return Err(ProxyError::FilterCorruptedEncoding);
        }
    }
    Ok(())
}
