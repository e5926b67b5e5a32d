use crate::apps::AppManifest;
use crate::state::Site;
use std::fmt::Write;
use std::path::Path;

/// Render the server fragment for one site. The fragment references the
/// site's materialized TLS files and `www` symlink, and folds in the app
/// manifest (caching, headers, rewrites, error pages) when one shipped
/// with the bundle.
pub fn site_fragment(site: &Site, manifest: Option<&AppManifest>, root: &Path) -> String {
    let site_dir = root.join("sites").join(&site.domain);
    let tls_dir = site_dir.join("tls");
    let mut names = vec![site.domain.clone()];
    names.extend(site.aliases.iter().cloned());

    let mut out = String::with_capacity(1024);
    let _ = writeln!(out, "# managed by statiko; manual edits are overwritten");
    let _ = writeln!(out, "server {{");
    let _ = writeln!(out, "    listen 80;");
    let _ = writeln!(out, "    listen 443 ssl;");
    let _ = writeln!(out, "    http2 on;");
    let _ = writeln!(out, "    server_name {};", names.join(" "));
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "    ssl_certificate     {};",
        tls_dir.join("certificate.pem").display()
    );
    let _ = writeln!(
        out,
        "    ssl_certificate_key {};",
        tls_dir.join("key.pem").display()
    );
    let _ = writeln!(
        out,
        "    ssl_dhparam         {};",
        tls_dir.join("dhparams.pem").display()
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "    root {};", site_dir.join("www").display());
    let _ = writeln!(out, "    index index.html index.htm;");

    // HTTP-01 challenges are materialized per-site under acme/ and must be
    // reachable over plain HTTP.
    let _ = writeln!(out);
    let _ = writeln!(out, "    location ^~ /.well-known/acme-challenge/ {{");
    let _ = writeln!(out, "        root {};", site_dir.join("acme").display());
    let _ = writeln!(out, "        default_type text/plain;");
    let _ = writeln!(out, "    }}");

    if let Some(manifest) = manifest {
        for (pattern, replacement) in sorted(&manifest.rewrite) {
            let _ = writeln!(out);
            let _ = writeln!(out, "    rewrite \"{}\" \"{}\";", pattern, replacement);
        }

        for rule in &manifest.rules {
            let _ = writeln!(out);
            match (&rule.match_regex, &rule.exact) {
                (Some(re), _) => {
                    let _ = writeln!(out, "    location ~ \"{}\" {{", re);
                }
                (None, Some(path)) => {
                    let _ = writeln!(out, "    location = {} {{", path);
                }
                (None, None) => continue,
            }
            if let Some(caching) = &rule.client_caching {
                let _ = writeln!(out, "        expires {};", caching);
            }
            for (name, value) in sorted(&rule.headers) {
                let _ = writeln!(out, "        add_header \"{}\" \"{}\";", name, value);
            }
            let _ = writeln!(out, "    }}");
        }

        if let Some(page) = &manifest.page403 {
            let _ = writeln!(out);
            let _ = writeln!(out, "    error_page 403 /{};", page);
        }
        if let Some(page) = &manifest.page404 {
            if manifest.page403.is_none() {
                let _ = writeln!(out);
            }
            let _ = writeln!(out, "    error_page 404 /{};", page);
        }
    }

    let _ = writeln!(out, "}}");
    out
}

/// Catch-all server answering for unknown hosts with the welcome content.
pub fn default_fragment(root: &Path) -> String {
    let mut out = String::with_capacity(256);
    let _ = writeln!(out, "# managed by statiko; manual edits are overwritten");
    let _ = writeln!(out, "server {{");
    let _ = writeln!(out, "    listen 80 default_server;");
    let _ = writeln!(out, "    server_name _;");
    let _ = writeln!(out);
    let _ = writeln!(out, "    root {};", root.join("apps/_default").display());
    let _ = writeln!(out, "    index index.html;");
    let _ = writeln!(out, "}}");
    out
}

/// Deterministic iteration so renders are byte-stable across syncs.
fn sorted(map: &std::collections::HashMap<String, String>) -> Vec<(&String, &String)> {
    let mut items: Vec<_> = map.iter().collect();
    items.sort_by_key(|(k, _)| k.as_str());
    items
}
