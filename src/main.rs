use std::env;

use anyhow::{anyhow, Context};
use wafcloud::prelude::*;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let rt = tokio::runtime::Runtime::new()?;
    let mut cloud = create_cloud(rt.handle())?;
    if args.len() < 2 {
        print_usage(&args[0]);
        return Err(anyhow!("No arguments have been provided"));
    }
    match args[1].as_str() {
        "apply" => cloud.apply().context("Could not apply WAF configuration"),
        "destroy" => cloud.destroy().context("Could not destroy WAF configuration"),
        other => {
            print_usage(&args[0]);
            Err(anyhow!("Invalid command: {}", other))
        }
    }
}

fn print_usage(cmd: &str) {
    println!("Usage: {} <command>", cmd);
    println!("Commands:");
    println!("  apply    Apply the configuration");
    println!("  destroy  Destroy the configuration");
}

fn create_cloud(handle: &tokio::runtime::Handle) -> anyhow::Result<WafCloud> {
    let mut cloud = WafCloud::default();
    cloud.init_registry(handle.clone());
    let waf = cloud.waf_provider(handle.clone(), "us-east-1");
    let blocked_addresses = waf.resource::<IpSet>(
        "blocked-addresses",
        Present,
        IpSetInput {
            descriptors: vec![
                SerializableIpSetDescriptor {
                    r#type: SerializableIpSetDescriptorType::Ipv4,
                    value: "192.0.2.0/24".to_string(),
                },
                SerializableIpSetDescriptor {
                    r#type: SerializableIpSetDescriptorType::Ipv4,
                    value: "198.51.100.0/24".to_string(),
                },
            ],
            ..Default::default()
        },
    )?;
    let blocked_requests = waf.resource::<Rule>(
        "blocked-requests",
        Present,
        RuleInput {
            metric_name: Some("BlockedRequests".to_string()),
            ..Default::default()
        },
    )?;
    blocked_requests.bind(&blocked_addresses, |input, ip_set| {
        input.predicates = vec![SerializablePredicate {
            negated: false,
            r#type: SerializablePredicateType::IpMatch,
            data_id: ip_set.ip_set_id.clone(),
        }];
    })?;
    Ok(cloud)
}
