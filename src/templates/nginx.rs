use super::SiteContext;

const MIME_TYPES: &[(&str, &str)] = &[
    ("text/html", "html htm"),
    ("text/css", "css"),
    ("text/plain", "txt"),
    ("application/javascript", "js mjs"),
    ("application/json", "json map"),
    ("application/xml", "xml"),
    ("image/png", "png"),
    ("image/jpeg", "jpg jpeg"),
    ("image/gif", "gif"),
    ("image/svg+xml", "svg"),
    ("image/webp", "webp"),
    ("image/x-icon", "ico"),
    ("font/woff", "woff"),
    ("font/woff2", "woff2"),
];

const FASTCGI_PARAMS: &[(&str, &str)] = &[
    ("QUERY_STRING", "$query_string"),
    ("REQUEST_METHOD", "$request_method"),
    ("CONTENT_TYPE", "$content_type"),
    ("CONTENT_LENGTH", "$content_length"),
    ("SCRIPT_NAME", "$fastcgi_script_name"),
    ("REQUEST_URI", "$request_uri"),
    ("DOCUMENT_URI", "$document_uri"),
    ("DOCUMENT_ROOT", "$document_root"),
    ("SERVER_PROTOCOL", "$server_protocol"),
    ("REQUEST_SCHEME", "$scheme"),
    ("GATEWAY_INTERFACE", "CGI/1.1"),
    ("SERVER_SOFTWARE", "nginx/$nginx_version"),
    ("REMOTE_ADDR", "$remote_addr"),
    ("REMOTE_PORT", "$remote_port"),
    ("SERVER_ADDR", "$server_addr"),
    ("SERVER_PORT", "$server_port"),
    ("SERVER_NAME", "$server_name"),
    ("REDIRECT_STATUS", "200"),
];

/// Self-contained nginx configuration: no system `mime.types` or
/// `fastcgi_params` include, so any nginx build can run it with `-c`.
pub(crate) fn render(ctx: &SiteContext<'_>) -> String {
    let logs = ctx.logs_dir.display();
    let run = ctx.run_dir.display();

    let types: String = MIME_TYPES
        .iter()
        .map(|(mime, exts)| format!("        {} {};\n", mime, exts))
        .collect();
    let params: String = FASTCGI_PARAMS
        .iter()
        .map(|(name, value)| format!("            fastcgi_param {} {};\n", name, value))
        .collect();

    format!(
        r#"# {header}
daemon off;
worker_processes 1;
pid {run}/nginx.pid;
error_log {logs}/error.log warn;

events {{
    worker_connections 256;
}}

http {{
    types {{
{types}    }}
    default_type application/octet-stream;
    sendfile on;
    keepalive_timeout 65;
    client_max_body_size 64m;

    access_log {logs}/access.log;
    client_body_temp_path {run}/client_body;
    proxy_temp_path {run}/proxy;
    fastcgi_temp_path {run}/fastcgi;
    uwsgi_temp_path {run}/uwsgi;
    scgi_temp_path {run}/scgi;

    server {{
        listen {listen};
        server_name {site};
        root {root};
        index index.php index.html;
        charset utf-8;

        location / {{
            try_files $uri $uri/ /index.php?$query_string;
        }}

        location ~ \.php$ {{
            fastcgi_pass unix:{socket};
            fastcgi_index index.php;
            fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;
{params}        }}

        location ~ /\.(?!well-known).* {{
            deny all;
        }}
    }}
}}
"#,
        header = ctx.header,
        run = run,
        logs = logs,
        types = types,
        listen = ctx.listen,
        site = ctx.site,
        root = ctx.document_root.display(),
        socket = ctx.socket.display(),
        params = params,
    )
}
