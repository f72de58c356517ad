use std::path::Path;

use super::SiteContext;

const MODULES: &[(&str, &str)] = &[
    ("mpm_event_module", "mod_mpm_event.so"),
    ("unixd_module", "mod_unixd.so"),
    ("authz_core_module", "mod_authz_core.so"),
    ("dir_module", "mod_dir.so"),
    ("mime_module", "mod_mime.so"),
    ("log_config_module", "mod_log_config.so"),
    ("rewrite_module", "mod_rewrite.so"),
    ("proxy_module", "mod_proxy.so"),
    ("proxy_fcgi_module", "mod_proxy_fcgi.so"),
];

/// Standalone httpd configuration for `httpd -f <file> -DFOREGROUND`.
pub(crate) fn render(ctx: &SiteContext<'_>, modules_dir: &Path) -> String {
    let modules: String = MODULES
        .iter()
        .map(|(name, file)| format!("LoadModule {} {}\n", name, modules_dir.join(file).display()))
        .collect();
    let logs = ctx.logs_dir.display();
    let run = ctx.run_dir.display();
    let root = ctx.document_root.display();

    format!(
        r#"# {header}
ServerRoot "{dir}"
PidFile "{run}/httpd.pid"
Mutex file:{run} default
DefaultRuntimeDir "{run}"

{modules}
Listen {listen}
ServerName {site}
ErrorLog "{logs}/error.log"
LogLevel warn
LogFormat "%h %l %u %t \"%r\" %>s %b \"%{{Referer}}i\" \"%{{User-Agent}}i\"" combined

TypesConfig /dev/null
AddType text/html .html .htm
AddType text/css .css
AddType application/javascript .js
AddType application/json .json
AddType image/png .png
AddType image/jpeg .jpg .jpeg
AddType image/svg+xml .svg
DirectoryIndex index.php index.html

<VirtualHost {listen}>
    ServerName {site}
    DocumentRoot "{root}"

    <Directory "{root}">
        AllowOverride All
        Require all granted
    </Directory>

    <FilesMatch \.php$>
        SetHandler "proxy:unix:{socket}|fcgi://localhost/"
    </FilesMatch>

    ErrorLog "{logs}/error.log"
    CustomLog "{logs}/access.log" combined
</VirtualHost>
"#,
        header = ctx.header,
        dir = ctx.directory.display(),
        run = run,
        modules = modules,
        listen = ctx.listen,
        site = ctx.site,
        logs = logs,
        root = root,
        socket = ctx.socket.display(),
    )
}
