//! # mqtt-reg CLI
//!
//! Command-line utilities for inspecting register topics and payloads.

use anyhow::{bail, Context, Result};
use mqtt_reg_proto::{payload, Topic, TopicScheme};
use std::env;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let scheme = env::var("REGISTRY_TOPIC_PREFIX")
        .map_or_else(|_| TopicScheme::default(), TopicScheme::new);

    match args[1].as_str() {
        "topics" => {
            if args.len() < 3 {
                eprintln!("Usage: mqtt-reg topics <name>");
                std::process::exit(1);
            }
            let name = &args[2];
            println!("advertise  {}", scheme.advertise(name));
            println!("get        {}", scheme.get(name));
            println!("set        {}", scheme.set(name));
            println!("is         {}", scheme.is(name));
        }
        "parse" => {
            if args.len() < 3 {
                eprintln!("Usage: mqtt-reg parse <topic>");
                std::process::exit(1);
            }
            let topic = &args[2];
            match scheme.parse(topic) {
                Some(Topic::AdvertiseRequest) => println!("advertise request"),
                Some(Topic::Get(name)) => println!("get {name}"),
                Some(Topic::Set(name)) => println!("set {name}"),
                Some(Topic::Is(name)) => println!("is {name}"),
                Some(Topic::Advertise(name)) => println!("advertise {name}"),
                None => bail!("Not a register topic: {topic}"),
            }
        }
        "payload" => {
            if args.len() < 3 {
                eprintln!("Usage: mqtt-reg payload <json>");
                std::process::exit(1);
            }
            let value = serde_json::from_str(&args[2]).context("Invalid JSON value")?;
            let encoded = payload::encode(&value);
            if encoded.is_empty() {
                println!("(empty payload)");
            } else {
                println!("{}", String::from_utf8_lossy(&encoded));
            }
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"mqtt-reg CLI

USAGE:
    mqtt-reg <COMMAND> [OPTIONS]

COMMANDS:
    topics <name>     Print the topics used by a register
    parse <topic>     Classify a topic within the register scheme
    payload <json>    Show the wire payload for a JSON value
    help              Show this help message

ENVIRONMENT:
    REGISTRY_TOPIC_PREFIX   Topic prefix (default: register)

EXAMPLES:
    mqtt-reg topics lamp
    mqtt-reg parse "register/lamp/set"
    mqtt-reg payload null
"#
    );
}
