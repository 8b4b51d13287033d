use crate::error::{DashClientError, DashClientResult};
use crate::mpd::{AdaptationSet, MpdMetadata, Representation};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

type Attributes = HashMap<String, String>;

#[allow(clippy::if_same_then_else)]
fn infer_content_type(mime_type: &str) -> &str {
    if mime_type.contains("audio") {
        "audio"
    } else if mime_type.contains("video") {
        "video"
    } else {
        "video" // fallback
    }
}

/// Representation as read, before templates from the enclosing adaptation set are applied.
struct PendingRepresentation {
    id: String,
    bandwidth: u64,
    template: Option<Attributes>,
}

struct PendingAdaptation {
    content_type: String,
    mime_type: String,
    template: Option<Attributes>,
    representations: Vec<PendingRepresentation>,
}

pub fn parse_mpd(xml: &str) -> DashClientResult<MpdMetadata> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut metadata = MpdMetadata::default();

    let mut current_adaptation: Option<PendingAdaptation> = None;
    let mut current_rep: Option<PendingRepresentation> = None;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        let is_empty = matches!(event, Event::Empty(_));

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => match e.local_name().as_ref() {
                b"MPD" => {
                    let attrs = read_attributes(e)?;
                    if let Some(value) = attrs.get("minBufferTime") {
                        metadata.min_buffer_time = parse_duration(value);
                    }
                }
                b"AdaptationSet" => {
                    let attrs = read_attributes(e)?;
                    let mime = attrs.get("mimeType").cloned().unwrap_or_default();
                    let content_type = match attrs.get("contentType") {
                        Some(content) if !content.is_empty() => content.clone(),
                        _ => infer_content_type(&mime).to_string(),
                    };
                    let adaptation = PendingAdaptation {
                        content_type,
                        mime_type: mime,
                        template: None,
                        representations: vec![],
                    };
                    if is_empty {
                        metadata.adaptation_sets.push(resolve_adaptation(adaptation)?);
                    } else {
                        current_adaptation = Some(adaptation);
                    }
                }
                b"Representation" => {
                    let attrs = read_attributes(e)?;
                    let rep = PendingRepresentation {
                        id: attrs.get("id").cloned().unwrap_or_default(),
                        bandwidth: parse_number(&attrs, "bandwidth")?.unwrap_or(0),
                        template: None,
                    };
                    if is_empty {
                        if let Some(adaptation) = current_adaptation.as_mut() {
                            adaptation.representations.push(rep);
                        }
                    } else {
                        current_rep = Some(rep);
                    }
                }
                b"SegmentTemplate" => {
                    let attrs = read_attributes(e)?;
                    if let Some(rep) = current_rep.as_mut() {
                        rep.template = Some(attrs);
                    } else if let Some(adaptation) = current_adaptation.as_mut() {
                        adaptation.template = Some(attrs);
                    }
                }
                _ => {}
            },

            Event::End(ref e) => match e.local_name().as_ref() {
                b"Representation" => {
                    if let (Some(rep), Some(adaptation)) =
                        (current_rep.take(), current_adaptation.as_mut())
                    {
                        adaptation.representations.push(rep);
                    }
                }
                b"AdaptationSet" => {
                    if let Some(adaptation) = current_adaptation.take() {
                        metadata.adaptation_sets.push(resolve_adaptation(adaptation)?);
                    }
                }
                _ => {}
            },

            Event::Eof => break,
            _ => {}
        }

        buf.clear();
    }

    Ok(metadata)
}

fn read_attributes(e: &BytesStart<'_>) -> DashClientResult<Attributes> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
        let value = attr.unescape_value()?.to_string();
        map.insert(key, value);
    }
    Ok(map)
}

fn parse_number(attrs: &Attributes, attribute: &str) -> DashClientResult<Option<u64>> {
    attrs
        .get(attribute)
        .map(|value| {
            value.trim().parse::<u64>().map_err(|_| DashClientError::InvalidAttribute {
                attribute: attribute.to_string(),
                value: value.clone(),
            })
        })
        .transpose()
}

/// Applies the SegmentTemplate of each representation, falling back attribute by attribute
/// to the adaptation-set level template.
fn resolve_adaptation(adaptation: PendingAdaptation) -> DashClientResult<AdaptationSet> {
    let mut representations = Vec::with_capacity(adaptation.representations.len());

    for pending in adaptation.representations {
        let mut template = adaptation.template.clone().unwrap_or_default();
        if let Some(own) = pending.template {
            template.extend(own);
        }

        let has_template = template.contains_key("media");
        let timescale = parse_number(&template, "timescale")?.unwrap_or(1).max(1);
        let duration = parse_number(&template, "duration")?.unwrap_or(0);
        let start_number = parse_number(&template, "startNumber")?.unwrap_or(1);

        let substitute = |key: &str| {
            template
                .get(key)
                .map(|value| value.replace("$RepresentationID$", &pending.id))
                .unwrap_or_default()
        };

        representations.push(Representation {
            initialization: substitute("initialization"),
            media: substitute("media"),
            segment_duration: duration as f64 / timescale as f64,
            timescale,
            start_number,
            has_template,
            bandwidth: pending.bandwidth,
            id: pending.id,
        });
    }

    Ok(AdaptationSet {
        content_type: adaptation.content_type,
        mime_type: adaptation.mime_type,
        representations,
    })
}

fn parse_duration(value: &str) -> Option<f64> {
    let iso = iso8601_duration::Duration::parse(value).ok()?;
    iso.to_std().map(|d| d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE_MPD: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" minBufferTime="PT1.5S">
  <Period id="0" start="PT0.0S">
    <AdaptationSet contentType="audio" mimeType="audio/mp4">
      <SegmentTemplate timescale="48000" duration="96000" initialization="init-$RepresentationID$.m4s" media="chunk-$RepresentationID$-$Number%05d$.m4s" startNumber="1"/>
      <Representation id="1" bandwidth="128000"/>
    </AdaptationSet>
    <AdaptationSet mimeType="video/mp4">
      <SegmentTemplate timescale="1000000" duration="2000000" initialization="init-stream$RepresentationID$.m4s" media="chunk-stream$RepresentationID$-$Number%05d$.m4s" startNumber="5"/>
      <Representation id="0" bandwidth="2000000" width="1280" height="720"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn parses_adaptation_level_templates() {
        let mpd = parse_mpd(LIVE_MPD).unwrap();
        assert_eq!(mpd.min_buffer_time, Some(1.5));
        assert_eq!(mpd.adaptation_sets.len(), 2);

        let video = mpd.video_representation().unwrap();
        assert_eq!(video.id, "0");
        assert_eq!(video.bandwidth, 2_000_000);
        assert_eq!(video.initialization, "init-stream0.m4s");
        assert_eq!(video.media, "chunk-stream0-$Number%05d$.m4s");
        assert_eq!(video.segment_duration, 2.0);
        assert_eq!(video.start_number, 5);
        assert_eq!(mpd.adaptation_sets[0].content_type, "audio");
    }

    #[test]
    fn representation_template_overrides_adaptation_template() {
        let xml = r#"<MPD minBufferTime="PT2S"><Period>
            <AdaptationSet contentType="video">
              <SegmentTemplate timescale="90000" duration="180000" media="$RepresentationID$/$Number$.m4s" initialization="$RepresentationID$/init.mp4"/>
              <Representation id="hd" bandwidth="5000000">
                <SegmentTemplate duration="90000" startNumber="0"/>
              </Representation>
            </AdaptationSet>
        </Period></MPD>"#;

        let mpd = parse_mpd(xml).unwrap();
        let video = mpd.video_representation().unwrap();
        assert_eq!(video.media, "hd/$Number$.m4s");
        assert_eq!(video.initialization, "hd/init.mp4");
        assert_eq!(video.segment_duration, 1.0);
        assert_eq!(video.start_number, 0);
    }

    #[test]
    fn missing_template_is_not_usable() {
        let xml = r#"<MPD><Period><AdaptationSet mimeType="video/mp4">
            <Representation id="0" bandwidth="1"/>
        </AdaptationSet></Period></MPD>"#;
        let mpd = parse_mpd(xml).unwrap();
        assert!(mpd.video_representation().is_none());
    }

    #[test]
    fn bad_numbers_are_reported() {
        let xml = r#"<MPD><Period><AdaptationSet mimeType="video/mp4">
            <Representation id="0" bandwidth="fast"/>
        </AdaptationSet></Period></MPD>"#;
        assert!(matches!(
            parse_mpd(xml),
            Err(DashClientError::InvalidAttribute { .. })
        ));
    }
}
