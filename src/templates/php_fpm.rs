use super::{PoolTemplate, SiteContext};

/// PHP-FPM master config with a single pool named after the recipe.
pub(crate) fn render(ctx: &SiteContext<'_>, template: PoolTemplate) -> String {
    let logs = ctx.logs_dir.display();
    let decorate = match template {
        PoolTemplate::Modern => "decorate_workers_output = no\n",
        PoolTemplate::Legacy => "",
    };

    format!(
        r#"; {header}
[global]
pid = {run}/php-fpm.pid
error_log = {logs}/php-fpm.log
daemonize = no

[{pool}]
listen = {socket}
listen.mode = 0660
pm = dynamic
pm.max_children = 5
pm.start_servers = 2
pm.min_spare_servers = 1
pm.max_spare_servers = 3
clear_env = no
catch_workers_output = yes
{decorate}php_admin_flag[log_errors] = on
php_admin_value[error_log] = {logs}/php-error.log
"#,
        header = ctx.header,
        run = ctx.run_dir.display(),
        logs = logs,
        pool = ctx.recipe_name,
        socket = ctx.socket.display(),
        decorate = decorate,
    )
}
