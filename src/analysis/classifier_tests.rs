use super::*;

/// Helper to build a classifier with an explicit smoothing window and margin
fn create_classifier(window: usize, margin: Option<f64>) -> BlinkClassifier {
    let config = ClassifierConfig {
        smoothing_window: window,
        confidence_margin: margin,
        ..ClassifierConfig::default()
    };
    BlinkClassifier::new(Profile::new("test", 100, -100, 0), &config)
}

fn samples(values: &[i32]) -> Vec<Sample> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| Sample::single(i as u64 * 1_000, *v))
        .collect()
}

fn run(classifier: &mut BlinkClassifier, values: &[i32]) -> Vec<BlinkEvent> {
    samples(values)
        .iter()
        .filter_map(|s| classifier.process(s))
        .collect()
}

#[test]
fn test_single_positive_blink_with_scaled_confidence() {
    let mut classifier = create_classifier(1, Some(50.0));
    let events = run(&mut classifier, &[0, 0, 120, 120, 0]);

    assert_eq!(events.len(), 1, "Expected exactly one event, got {:?}", events);
    assert_eq!(events[0].polarity, Polarity::Positive);
    assert_eq!(events[0].timestamp_us, 2_000);
    assert!(
        (events[0].confidence - 0.4).abs() < 1e-9,
        "Expected confidence 0.4, got {}",
        events[0].confidence
    );
}

#[test]
fn test_default_margin_is_half_the_span() {
    // span = 100, margin = 50
    let mut classifier = create_classifier(1, None);
    let events = run(&mut classifier, &[0, 125]);
    assert_eq!(events.len(), 1);
    assert!((events[0].confidence - 0.5).abs() < 1e-9);
}

#[test]
fn test_confidence_saturates() {
    let mut classifier = create_classifier(1, Some(50.0));
    let events = run(&mut classifier, &[0, i32::MAX / 2, 0, i32::MIN / 2]);

    assert_eq!(events.len(), 2);
    for event in &events {
        assert!(
            (0.0..=1.0).contains(&event.confidence),
            "Confidence should be between 0.0 and 1.0, got {}",
            event.confidence
        );
        assert_eq!(event.confidence, 1.0);
    }
}

#[test]
fn test_exact_threshold_scores_zero() {
    let mut classifier = create_classifier(1, None);
    let events = run(&mut classifier, &[100]);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].confidence, 0.0);
}

#[test]
fn test_oscillation_at_threshold_fires_once_per_cycle() {
    let mut classifier = create_classifier(1, None);
    let mut values = Vec::new();
    for _ in 0..3 {
        // Chatter around the threshold, then a true return to baseline
        for i in 0..20 {
            values.push(if i % 2 == 0 { 101 } else { 99 });
        }
        values.push(0);
    }

    let events = run(&mut classifier, &values);
    assert_eq!(
        events.len(),
        3,
        "Expected one event per crossing-and-return cycle, got {}",
        events.len()
    );
    assert!(events.iter().all(|e| e.polarity == Polarity::Positive));
}

#[test]
fn test_negative_blink() {
    let mut classifier = create_classifier(1, Some(50.0));
    let events = run(&mut classifier, &[0, -110, -130, 0]);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].polarity, Polarity::Negative);
    assert!((events[0].confidence - 0.2).abs() < 1e-9);
}

#[test]
fn test_smoothing_suppresses_single_sample_spike() {
    let mut classifier = create_classifier(5, None);
    let events = run(&mut classifier, &[0, 0, 0, 0, 400, 0, 0, 0, 0]);
    assert!(events.is_empty(), "Single spike should be smoothed away");

    // A sustained excursion gets through
    let events = run(&mut classifier, &[200, 200, 200, 200, 200]);
    assert_eq!(events.len(), 1);
}

#[test]
fn test_missing_channel_is_ignored() {
    let config = ClassifierConfig {
        smoothing_window: 1,
        channel: 1,
        ..ClassifierConfig::default()
    };
    let mut classifier = BlinkClassifier::new(Profile::new("test", 100, -100, 0), &config);
    assert!(classifier.process(&Sample::single(0, 500)).is_none());
    assert!(classifier.process(&Sample::new(1, vec![0, 500])).is_some());
}

#[test]
fn test_profile_swap_rearms() {
    let mut classifier = create_classifier(1, None);
    assert_eq!(run(&mut classifier, &[150]).len(), 1);

    classifier.set_profile(Profile::new("higher", 300, -100, 0));
    assert!(run(&mut classifier, &[150]).is_empty());
    assert_eq!(run(&mut classifier, &[310]).len(), 1);
    assert_eq!(classifier.profile().name, "higher");
}

#[tokio::test]
async fn test_blink_events_stream() {
    let classifier = create_classifier(1, Some(50.0));
    let input = futures::stream::iter(samples(&[0, 120, 0, -120, 0]));

    let events: Vec<BlinkEvent> = blink_events(input, classifier).collect().await;
    let polarities: Vec<Polarity> = events.iter().map(|e| e.polarity).collect();
    assert_eq!(polarities, vec![Polarity::Positive, Polarity::Negative]);
}
