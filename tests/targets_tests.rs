use bleed_scan_rs::targets::{expand, parse_line, LineError};
use bleed_scan_rs::types::Mode;

#[test]
fn subnet_line_yields_usable_hosts() {
    let hosts: Vec<String> = parse_line("https,10.0.0.0/30,443")
        .expect("parse ok")
        .map(|t| t.host)
        .collect();
    assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2"]);
}

#[test]
fn host_line_yields_single_target() {
    let targets: Vec<_> = parse_line("smtp,example.org,25").expect("parse ok").collect();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].mode, Mode::Smtp);
    assert_eq!(targets[0].address(), "example.org:25");
}

#[test]
fn unknown_mode_yields_nothing() {
    assert!(matches!(
        parse_line("bogus,1.2.3.4,80"),
        Err(LineError::InvalidMode(_))
    ));
}

#[test]
fn every_mode_is_accepted() {
    for mode in ["ftp", "https", "imap", "pop3", "smtp"] {
        let line = format!("{mode},192.0.2.1,1");
        assert_eq!(parse_line(&line).expect("valid mode").count(), 1, "{mode}");
    }
}

#[test]
fn expansion_is_lazy() {
    // A /8 has ~16M hosts; taking a few must not materialise the rest.
    let first: Vec<String> = expand(Mode::Imap, "10.0.0.0/8", "993")
        .expect("valid subnet")
        .take(3)
        .map(|t| t.host)
        .collect();
    assert_eq!(first, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
}
