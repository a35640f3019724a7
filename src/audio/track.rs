use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, sync::Arc, time::Duration};
use tracing::debug;

/// Metadatos que reporta el nodo para un track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duración en milisegundos
    pub length: u64,
    pub is_stream: bool,
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
}

/// Track reproducible.
///
/// `encoded` es el payload opaco que entrega el nodo al resolver y que espera
/// de vuelta al reproducir. Los tracks no se mutan una vez creados; la cola y
/// el player los comparten con `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    #[serde(default, alias = "track")]
    pub encoded: Option<String>,
    #[serde(default)]
    pub info: TrackInfo,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub plugin_info: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<u64>,
}

impl Track {
    /// Crea un track desde su payload y metadatos
    pub fn new(encoded: impl Into<String>, info: TrackInfo) -> Self {
        Self {
            encoded: Some(encoded.into()),
            info,
            plugin_info: Value::Null,
            requester: None,
        }
    }

    /// Asigna quién pidió el track
    pub fn with_requester(mut self, requester: u64) -> Self {
        self.requester = Some(requester);
        self
    }

    /// Payload que se envía al nodo al reproducir
    pub fn payload(&self) -> Option<&str> {
        self.encoded.as_deref().filter(|encoded| !encoded.is_empty())
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn author(&self) -> &str {
        &self.info.author
    }

    /// Obtiene la duración
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.info.length)
    }

    /// Verifica si es un stream en vivo
    pub fn is_stream(&self) -> bool {
        self.info.is_stream
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} by {}", self.info.title, self.info.author)?;
        if !self.info.is_stream && self.info.length > 0 {
            // Solo segundos enteros
            let secs = Duration::from_secs(self.info.length / 1000);
            write!(f, " ({})", humantime::format_duration(secs))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    Track,
    Playlist,
    Search,
    Empty,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaylistInfo {
    pub name: String,
    pub selected_track: Option<usize>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadException {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub cause: String,
}

/// Respuesta normalizada de `loadtracks`
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub load_type: LoadType,
    pub tracks: Vec<Arc<Track>>,
    pub playlist: Option<PlaylistInfo>,
    pub exception: Option<LoadException>,
}

impl LoadResult {
    pub fn empty() -> Self {
        Self {
            load_type: LoadType::Empty,
            tracks: Vec::new(),
            playlist: None,
            exception: None,
        }
    }

    /// Construye el resultado desde la respuesta cruda del nodo.
    ///
    /// Se descartan tracks sin payload. Los load types de v3 (`NO_MATCHES`,
    /// `LOAD_FAILED`) se mapean a sus equivalentes de v4.
    pub fn from_response(response: Value, requester: Option<u64>) -> Self {
        let load_type = response
            .get("loadType")
            .and_then(Value::as_str)
            .unwrap_or("empty");
        let data = response.get("data").cloned().unwrap_or(Value::Null);

        let mut result = Self::empty();

        match load_type {
            "track" => {
                result.load_type = LoadType::Track;
                result.tracks.extend(parse_track(data, requester));
            }
            "playlist" => {
                result.load_type = LoadType::Playlist;
                let info = data.get("info");
                let tracks = data
                    .get("tracks")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                let thumbnail = data
                    .pointer("/pluginInfo/artworkUrl")
                    .or_else(|| tracks.first().and_then(|t| t.pointer("/info/artworkUrl")))
                    .and_then(Value::as_str)
                    .map(str::to_string);

                result.playlist = info.map(|info| PlaylistInfo {
                    name: info
                        .get("name")
                        .or_else(|| info.get("title"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    selected_track: info
                        .get("selectedTrack")
                        .and_then(Value::as_i64)
                        .and_then(|index| usize::try_from(index).ok()),
                    thumbnail,
                });

                result.tracks = tracks
                    .into_iter()
                    .filter_map(|track| parse_track(track, requester))
                    .collect();
            }
            "search" => {
                result.load_type = LoadType::Search;
                if let Value::Array(tracks) = data {
                    result.tracks = tracks
                        .into_iter()
                        .filter_map(|track| parse_track(track, requester))
                        .collect();
                }
            }
            "error" | "LOAD_FAILED" => {
                result.load_type = LoadType::Error;
                let source = if data.is_null() {
                    response.get("exception").cloned().unwrap_or(Value::Null)
                } else {
                    data
                };
                result.exception = serde_json::from_value(source).ok();
            }
            _ => {}
        }

        result
    }
}

fn parse_track(value: Value, requester: Option<u64>) -> Option<Arc<Track>> {
    match serde_json::from_value::<Track>(value) {
        Ok(mut track) if track.payload().is_some() => {
            track.requester = requester;
            Some(Arc::new(track))
        }
        Ok(track) => {
            debug!("Dropping track without payload: {}", track.info.title);
            None
        }
        Err(e) => {
            debug!("Dropping malformed track: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn track_json(encoded: &str, title: &str) -> Value {
        json!({
            "encoded": encoded,
            "info": {
                "identifier": "dQw4w9WgXcQ",
                "isSeekable": true,
                "author": "RickAstleyVEVO",
                "length": 212000,
                "isStream": false,
                "position": 0,
                "title": title,
                "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                "artworkUrl": null,
                "isrc": null,
                "sourceName": "youtube"
            },
            "pluginInfo": {},
            "userData": {}
        })
    }

    #[test]
    fn test_track_from_node_json() {
        let track: Track = serde_json::from_value(track_json("QAAA", "Never Gonna Give You Up")).unwrap();

        assert_eq!(track.payload(), Some("QAAA"));
        assert_eq!(track.title(), "Never Gonna Give You Up");
        assert_eq!(track.info.source_name, "youtube");
        assert_eq!(track.duration(), Duration::from_secs(212));
        assert_eq!(track.to_string(), "Never Gonna Give You Up by RickAstleyVEVO (3m 32s)");
    }

    #[test]
    fn test_search_result_drops_tracks_without_payload() {
        let response = json!({
            "loadType": "search",
            "data": [track_json("QAAA", "first"), track_json("", "broken"), track_json("QBBB", "second")]
        });

        let result = LoadResult::from_response(response, Some(42));

        assert_eq!(result.load_type, LoadType::Search);
        let titles: Vec<_> = result.tracks.iter().map(|t| t.title().to_string()).collect();
        assert_eq!(titles, vec!["first", "second"]);
        assert!(result.tracks.iter().all(|t| t.requester == Some(42)));
    }

    #[test]
    fn test_playlist_result_keeps_info() {
        let response = json!({
            "loadType": "playlist",
            "data": {
                "info": { "name": "Mix", "selectedTrack": -1 },
                "pluginInfo": {},
                "tracks": [track_json("QAAA", "one"), track_json("QBBB", "two")]
            }
        });

        let result = LoadResult::from_response(response, None);

        assert_eq!(result.load_type, LoadType::Playlist);
        assert_eq!(result.tracks.len(), 2);
        let playlist = result.playlist.unwrap();
        assert_eq!(playlist.name, "Mix");
        assert_eq!(playlist.selected_track, None);
    }

    #[test]
    fn test_error_and_empty_results() {
        let error = LoadResult::from_response(
            json!({
                "loadType": "error",
                "data": { "message": "Video unavailable", "severity": "common", "cause": "..." }
            }),
            None,
        );
        assert_eq!(error.load_type, LoadType::Error);
        assert_eq!(
            error.exception.and_then(|e| e.message).as_deref(),
            Some("Video unavailable")
        );

        let empty = LoadResult::from_response(json!({ "loadType": "empty", "data": {} }), None);
        assert_eq!(empty.load_type, LoadType::Empty);
        assert!(empty.tracks.is_empty());
    }
}
