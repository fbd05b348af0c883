//! Course outline generation served by the `topic-worker` binary.
//!
//! Produces the skeleton the web app fills in later: `num_topics` topics, each
//! with three subtopic slots taken from the request and padded with generated
//! titles.

use serde::Serialize;
use serde_json::{Value, json};

use crate::bridge::protocol::TopicRequest;

pub const SUBTOPICS_PER_TOPIC: usize = 3;
pub const MAX_TOPICS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subtopic {
    pub title: String,
    pub theory: String,
    pub youtube: String,
    pub image: String,
    pub done: bool,
}

impl Subtopic {
    fn titled(title: String) -> Self {
        Self {
            title,
            theory: String::new(),
            youtube: String::new(),
            image: String::new(),
            done: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topic {
    pub title: String,
    pub subtopics: Vec<Subtopic>,
}

/// Build the outline result for a request.
///
/// The result is `{"topics": n, "course": {"<main topic, lowercased>": [Topic...]}}`.
pub fn outline(request: &TopicRequest) -> Result<Value, String> {
    let num_topics: usize = request
        .num_topics
        .trim()
        .parse()
        .map_err(|_| format!("num_topics must be an integer, got {:?}", request.num_topics))?;
    if num_topics > MAX_TOPICS {
        return Err(format!("num_topics must be at most {MAX_TOPICS}, got {num_topics}"));
    }
    let main_topic = request.main_topic.trim();
    if main_topic.is_empty() {
        return Err("main_topic must not be empty".to_string());
    }

    let topics: Vec<Topic> = (1..=num_topics)
        .map(|i| Topic {
            title: format!("Topic {i}"),
            subtopics: (0..SUBTOPICS_PER_TOPIC)
                .map(|j| {
                    let title = request
                        .subtopics
                        .get(j)
                        .cloned()
                        .unwrap_or_else(|| format!("Generated Subtopic {}", j + 1));
                    Subtopic::titled(title)
                })
                .collect(),
        })
        .collect();

    Ok(json!({
        "topics": num_topics,
        "course": { main_topic.to_lowercase(): topics },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outline_shape() {
        let request = TopicRequest::new("Algebra", 2).with_subtopics(["Linear Equations"]);
        let result = outline(&request).unwrap();

        assert_eq!(result["topics"], json!(2));
        let topics = result["course"]["algebra"].as_array().unwrap();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[1]["title"], json!("Topic 2"));

        let subtopics = topics[0]["subtopics"].as_array().unwrap();
        assert_eq!(subtopics.len(), SUBTOPICS_PER_TOPIC);
        assert_eq!(subtopics[0]["title"], json!("Linear Equations"));
        assert_eq!(subtopics[2]["title"], json!("Generated Subtopic 3"));
        assert_eq!(subtopics[2]["done"], json!(false));
    }

    #[test]
    fn single_topic_snapshot() {
        let request = TopicRequest::new("Rust", 1).with_subtopics(["Ownership", "Borrowing"]);
        insta::assert_json_snapshot!(outline(&request).unwrap(), @r#"
        {
          "course": {
            "rust": [
              {
                "subtopics": [
                  {
                    "done": false,
                    "image": "",
                    "theory": "",
                    "title": "Ownership",
                    "youtube": ""
                  },
                  {
                    "done": false,
                    "image": "",
                    "theory": "",
                    "title": "Borrowing",
                    "youtube": ""
                  },
                  {
                    "done": false,
                    "image": "",
                    "theory": "",
                    "title": "Generated Subtopic 3",
                    "youtube": ""
                  }
                ],
                "title": "Topic 1"
              }
            ]
          },
          "topics": 1
        }
        "#);
    }

    #[test]
    fn zero_topics_is_empty_course() {
        let result = outline(&TopicRequest::new("History", 0)).unwrap();
        assert_eq!(result["course"]["history"], json!([]));
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let mut request = TopicRequest::new("Algebra", 1);
        request.num_topics = "five".to_string();
        assert!(outline(&request).unwrap_err().contains("integer"));

        let request = TopicRequest::new("Algebra", MAX_TOPICS + 1);
        assert!(outline(&request).unwrap_err().contains("at most"));

        let request = TopicRequest::new("   ", 1);
        assert!(outline(&request).unwrap_err().contains("main_topic"));
    }
}
