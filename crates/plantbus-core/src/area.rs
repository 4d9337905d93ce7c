//! Area Router (C1).
//!
//! Pure, side-effect-free normalization of human site names into canonical
//! slugs, plus the string composition that derives every queue/exchange
//! name an area owns. No component outside this module should hand-roll a
//! queue or routing-key name.

use std::collections::HashMap;

use unicode_normalization::UnicodeNormalization;

use crate::config::BrokerConfig;

/// A logical plant area: a human site name plus its canonical slug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Area {
    pub site: String,
    pub slug: String,
}

/// Every broker name an area owns, derived purely from the slug and the
/// broker prefixes in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaRouting {
    pub queue: String,
    pub retry_queue: String,
    pub dlq: String,
    pub dlx_exchange: String,
    pub binding_key: String,
    pub retry_routing_key: String,
    pub dlq_routing_key: String,
    pub alert_queue: String,
    pub alert_retry_queue: String,
    pub alert_dlq: String,
    pub alert_dlx_exchange: String,
    pub alert_binding_key: String,
    pub alert_retry_routing_key: String,
    pub alert_dlq_routing_key: String,
}

/// Normalize a site name to its canonical slug: Unicode-normalize, strip
/// diacritics/combining marks, replace runs of non-alphanumerics with `_`,
/// trim leading/trailing `_`, lowercase. Empty input (or input that
/// collapses to nothing once diacritics/punctuation are stripped) yields
/// `"unknown"`.
pub fn slugify(site: &str) -> String {
    let stripped: String = site
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect();

    let mut slug = String::with_capacity(stripped.len());
    let mut last_was_sep = true; // suppresses a leading underscore
    for ch in stripped.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if ch.is_alphanumeric() {
            // Non-ASCII alphanumeric left over after diacritic stripping
            // (rare): drop it rather than emit a non-ASCII slug char.
            continue;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF)
}

/// Process-lifetime registry of configured areas plus legacy-site aliases.
///
/// Invariant: `slug` is injective across areas — two configured sites that
/// collapse to the same slug are merged into one `Area`; the later
/// configuration entry only wins the display `site` name, never creates a
/// second area.
#[derive(Debug, Clone)]
pub struct AreaRegistry {
    areas: Vec<Area>,
    aliases: HashMap<String, String>,
}

impl AreaRegistry {
    /// Build a registry from an ordered list of configured site names and
    /// an alias map from legacy site name (any case/spelling) to canonical
    /// slug.
    pub fn new(sites: &[String], aliases: HashMap<String, String>) -> Self {
        let mut areas: Vec<Area> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();

        for site in sites {
            let slug = slugify(site);
            if let Some(&idx) = seen.get(&slug) {
                // Later entry wins the display name only.
                areas[idx].site = site.clone();
            } else {
                seen.insert(slug.clone(), areas.len());
                areas.push(Area {
                    site: site.clone(),
                    slug,
                });
            }
        }

        if areas.is_empty() {
            areas.push(Area {
                site: "unknown".to_string(),
                slug: "unknown".to_string(),
            });
        }

        Self { areas, aliases }
    }

    /// Default built-in alias map (legacy site spellings to canonical
    /// slugs), extendable by callers via `new`.
    pub fn default_aliases() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("recebimento_de_leite_cru".to_string(), "recepcao".to_string());
        m
    }

    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    /// Resolve a human site name to its configured area, applying aliases;
    /// falls back to the first configured area if nothing matches.
    pub fn resolve_area_by_site(&self, site: &str) -> &Area {
        let slug = slugify(site);
        let canonical = self.aliases.get(&slug).cloned().unwrap_or(slug);
        self.areas
            .iter()
            .find(|a| a.slug == canonical)
            .unwrap_or(&self.areas[0])
    }

    /// Resolve by an already-canonical slug, without alias lookup.
    pub fn find_by_slug(&self, slug: &str) -> Option<&Area> {
        self.areas.iter().find(|a| a.slug == slug)
    }
}

/// Derive every broker name an area owns from its slug and the configured
/// prefixes. Pure string composition — no I/O.
pub fn derive(slug: &str, cfg: &BrokerConfig) -> AreaRouting {
    AreaRouting {
        queue: format!("{}.{}", cfg.queue_base, slug),
        retry_queue: format!("{}.{}", cfg.retry_queue_base, slug),
        dlq: format!("{}.{}", cfg.dlq_base, slug),
        dlx_exchange: format!("dlx.{slug}"),
        binding_key: format!("{}.{}.#", cfg.routing_key_prefix, slug),
        retry_routing_key: format!("{}.{}.retry", cfg.routing_key_prefix, slug),
        dlq_routing_key: format!("{slug}.dead"),
        alert_queue: format!("{}.{}", cfg.alerts_queue_base, slug),
        alert_retry_queue: format!("{}.{}", cfg.alerts_retry_queue_base, slug),
        alert_dlq: format!("{}.{}", cfg.alerts_dlq_base, slug),
        alert_dlx_exchange: format!("alerts.dlx.{slug}"),
        alert_binding_key: format!("alerts.{slug}.#"),
        alert_retry_routing_key: format!("alerts.{slug}.retry"),
        alert_dlq_routing_key: format!("{slug}.alert.dead"),
    }
}

/// Telemetry publish routing key for a client in an area.
pub fn telemetry_routing_key(cfg: &BrokerConfig, area_slug: &str, client_id: &str) -> String {
    format!("{}.{}.{}", cfg.routing_key_prefix, area_slug, client_id)
}

/// Alert publish routing key for a client in an area.
pub fn alert_routing_key(area_slug: &str, client_id: &str) -> String {
    format!("alerts.{area_slug}.{client_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_strips_diacritics_and_normalizes() {
        assert_eq!(slugify("Recepção"), "recepcao");
        assert_eq!(slugify("Pasteurização"), "pasteurizacao");
        assert_eq!(slugify("  Multi   Word--Site  "), "multi_word_site");
        assert_eq!(slugify(""), "unknown");
        assert_eq!(slugify("   "), "unknown");
        assert_eq!(slugify("---"), "unknown");
    }

    #[test]
    fn slugify_is_idempotent_over_already_canonical_input() {
        let slug = slugify("Recepção");
        assert_eq!(slugify(&slug), slug);
    }

    #[test]
    fn colliding_sites_merge_into_one_area() {
        let registry = AreaRegistry::new(
            &["Recepção".to_string(), "recepcao".to_string()],
            HashMap::new(),
        );
        assert_eq!(registry.areas().len(), 1);
        // Later entry wins the display name.
        assert_eq!(registry.areas()[0].site, "recepcao");
    }

    #[test]
    fn resolve_area_by_site_is_consistent_with_slugify() {
        let registry = AreaRegistry::new(
            &["Pasteurização".to_string(), "Utilidades".to_string()],
            AreaRegistry::default_aliases(),
        );
        let by_site = registry.resolve_area_by_site("Pasteurização");
        let by_slug = registry.resolve_area_by_site(&slugify("Pasteurização"));
        assert_eq!(by_site.slug, by_slug.slug);
    }

    #[test]
    fn aliases_route_to_canonical_slug() {
        let registry = AreaRegistry::new(
            &["Recepção".to_string()],
            AreaRegistry::default_aliases(),
        );
        let area = registry.resolve_area_by_site("Recebimento de Leite Cru");
        assert_eq!(area.slug, "recepcao");
    }

    #[test]
    fn unresolved_site_falls_back_to_first_area() {
        let registry = AreaRegistry::new(
            &["Pasteurização".to_string(), "Utilidades".to_string()],
            HashMap::new(),
        );
        let area = registry.resolve_area_by_site("Some Unknown Place");
        assert_eq!(area.slug, registry.areas()[0].slug);
    }

    fn broker_cfg() -> BrokerConfig {
        BrokerConfig {
            url: "amqp://localhost".into(),
            vhost: "/".into(),
            heartbeat_secs: 60,
            prefetch: 50,
            exchange: "plant.telemetry".into(),
            exchange_type: "topic".into(),
            queue_base: "queue".into(),
            retry_queue_base: "retry".into(),
            dlq_base: "dlq".into(),
            retry_ttl_ms: 30_000,
            routing_key_prefix: "telemetry".into(),
            alerts_queue_base: "alertQueue".into(),
            alerts_retry_queue_base: "retry.alerts".into(),
            alerts_dlq_base: "alertDlq".into(),
            sites: vec![],
            consumer_area_slug: None,
            max_retries: 5,
            tls: Default::default(),
        }
    }

    #[test]
    fn derive_composes_expected_names() {
        let routing = derive("recepcao", &broker_cfg());
        assert_eq!(routing.queue, "queue.recepcao");
        assert_eq!(routing.retry_queue, "retry.recepcao");
        assert_eq!(routing.dlq, "dlq.recepcao");
        assert_eq!(routing.dlx_exchange, "dlx.recepcao");
        assert_eq!(routing.binding_key, "telemetry.recepcao.#");
        assert_eq!(routing.retry_routing_key, "telemetry.recepcao.retry");
        assert_eq!(routing.dlq_routing_key, "recepcao.dead");
        assert_eq!(routing.alert_binding_key, "alerts.recepcao.#");
        assert_eq!(routing.alert_dlq_routing_key, "recepcao.alert.dead");
    }

    #[test]
    fn routing_keys_embed_client_id() {
        let cfg = broker_cfg();
        assert_eq!(
            telemetry_routing_key(&cfg, "recepcao", "client-1"),
            "telemetry.recepcao.client-1"
        );
        assert_eq!(alert_routing_key("recepcao", "client-1"), "alerts.recepcao.client-1");
    }
}
