use std::collections::HashSet;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::models::ScanSummary;

/// Extracts the severity summary from a report blob. The blob is opaque to the
/// rest of the system; a malformed document yields whatever was counted up to
/// the parse failure (zeros in the worst case), never an error.
pub fn parse_summary(xml: &str) -> ScanSummary {
    let mut summary = ScanSummary::default();
    let mut hosts: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = Vec::new();
    let mut reader = Reader::from_str(xml);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                stack.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                let Ok(text) = t.unescape() else { continue };
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let parent = stack.len().checked_sub(2).map(|i| stack[i].as_str());
                match (stack.last().map(String::as_str), parent) {
                    // <result><threat>High</threat></result>
                    (Some("threat"), Some("result")) => match text {
                        "High" => summary.vulns_high += 1,
                        "Medium" => summary.vulns_medium += 1,
                        "Low" => summary.vulns_low += 1,
                        "Log" => summary.vulns_log += 1,
                        _ => {}
                    },
                    // <result><host>192.0.2.1</host></result>
                    (Some("host"), Some("result")) => {
                        hosts.insert(text.to_string());
                    }
                    // <host><ip>192.0.2.1</ip></host> in the host section
                    (Some("ip"), Some("host")) => {
                        hosts.insert(text.to_string());
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            Ok(_) => {}
        }
    }

    summary.hosts_scanned = hosts.len() as u64;
    summary
}

#[cfg(test)]
mod tests {
    use super::parse_summary;
    use crate::models::ScanSummary;

    pub const SAMPLE_REPORT: &str = r#"<report id="r-1">
  <report>
    <results>
      <result id="a"><host>192.168.15.20</host><threat>High</threat><severity>9.8</severity></result>
      <result id="b"><host>192.168.15.20</host><threat>Medium</threat></result>
      <result id="c"><host>192.168.15.21</host><threat>Medium</threat></result>
      <result id="d"><host>192.168.15.21</host><threat>Low</threat></result>
      <result id="e"><host>192.168.15.21</host><threat>Log</threat></result>
    </results>
    <host><ip>192.168.15.20</ip><detail><name>best_os_cpe</name></detail></host>
    <host><ip>192.168.15.21</ip></host>
  </report>
</report>"#;

    #[test]
    fn counts_results_by_threat_bucket() {
        let summary = parse_summary(SAMPLE_REPORT);
        assert_eq!(
            summary,
            ScanSummary {
                hosts_scanned: 2,
                vulns_high: 1,
                vulns_medium: 2,
                vulns_low: 1,
                vulns_log: 1,
            }
        );
    }

    #[test]
    fn hosts_are_deduplicated_across_sections() {
        let xml = r#"<report><report>
            <results>
              <result><host>10.0.0.1<asset asset_id="x"/></host><threat>Low</threat></result>
            </results>
            <host><ip>10.0.0.1</ip></host>
        </report></report>"#;
        let summary = parse_summary(xml);
        assert_eq!(summary.hosts_scanned, 1);
        assert_eq!(summary.vulns_low, 1);
    }

    #[test]
    fn unknown_threats_are_ignored() {
        let xml = r#"<report><result><host>10.0.0.1</host><threat>Critical</threat></result></report>"#;
        let summary = parse_summary(xml);
        assert_eq!(summary.vulns_high, 0);
        assert_eq!(summary.hosts_scanned, 1);
    }

    #[test]
    fn malformed_reports_yield_zeros() {
        assert_eq!(parse_summary(""), ScanSummary::default());
        assert_eq!(parse_summary("not xml at all"), ScanSummary::default());
        assert_eq!(parse_summary("<report><result>"), ScanSummary::default());
    }

    #[test]
    fn threat_outside_result_does_not_count() {
        let xml = r#"<report><filters><threat>High</threat></filters></report>"#;
        assert_eq!(parse_summary(xml), ScanSummary::default());
    }
}
