use afd_cache_core::api_types::RefreshOutcome;
use colored::Colorize;
use std::net::SocketAddr;

pub fn print_server_url(addr: SocketAddr, has_refresh_token: bool) {
    let url = format!("http://{}", addr);

    println!("Serving cached forecast discussions at:");
    println!();
    println!("   {}", url.bright_purple());
    println!();
    println!("For example:");
    println!();
    println!("    curl {}/afd/BOX", url);
    println!("    curl -X POST '{}/refresh?offices=BOX'", url);
    println!();
    if !has_refresh_token {
        println!(
            "{} {} {}",
            "****".bright_yellow().bold(),
            "No refresh token set; anyone can trigger a refresh. Pass --refresh-token in production."
                .bright_red()
                .bold(),
            "****".bright_yellow().bold(),
        );
        println!();
    }
}

pub fn print_refresh_results(results: &[RefreshOutcome]) {
    for result in results {
        if let Some(error) = &result.error {
            println!("{:>6}  {}  {}", result.office.bold(), "error".bright_red(), error);
            continue;
        }
        let reason = result
            .reason
            .and_then(|r| serde_json::to_value(r).ok())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        if result.updated {
            println!("{:>6}  {}", result.office.bold(), reason.bright_green());
        } else {
            println!("{:>6}  {}", result.office.bold(), reason.bright_black());
        }
    }
}
