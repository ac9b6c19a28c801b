use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::domain::listing::RawListing;
use crate::scrapers::{
    build_reqwest_client, select_first_attr, select_first_text, ScrapeError, ScrapeResult,
    SourceScraper,
};

const SOURCE_ID: &str = "autocosmos";

/// Scraper for `autocosmos.com.ve` used-car listings.
///
/// Autocosmos has gone through several markup revisions; the selector lists
/// cover the known generations in order of recency.
pub struct AutocosmosScraper {
    base_url: Url,
    client: reqwest::Client,
    id_re: Regex,
}

impl AutocosmosScraper {
    pub fn new() -> ScrapeResult<Self> {
        Ok(Self {
            base_url: Url::parse("https://www.autocosmos.com.ve/")
                .map_err(|e| ScrapeError::Build(e.to_string()))?,
            client: build_reqwest_client()?,
            // Detail URLs end in a numeric listing id.
            id_re: Regex::new(r"/(\d{4,})(?:$|[/?])").map_err(|e| ScrapeError::Build(e.to_string()))?,
        })
    }

    fn page_url(&self, page: u32) -> String {
        format!("{}auto/usado?pidx={page}", self.base_url)
    }

    async fn get_text(&self, url: &str) -> ScrapeResult<String> {
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScrapeError::Http(e.to_string()))?;
        if !res.status().is_success() {
            return Err(ScrapeError::Status {
                status: res.status().as_u16(),
                url: url.to_string(),
            });
        }
        res.text().await.map_err(|e| ScrapeError::Http(e.to_string()))
    }

    fn parse_page(&self, document: &Html) -> Vec<RawListing> {
        let card_selector =
            Selector::parse("article.listing-item, article.car-card, div.car-item, article")
                .unwrap();

        document
            .select(&card_selector)
            .filter_map(|card| self.parse_card(card))
            .collect()
    }

    fn parse_card(&self, card: scraper::ElementRef<'_>) -> Option<RawListing> {
        let title = select_first_text(card, &[".car-title", "h3 a", "h3", ".title"])?;

        let mut listing = RawListing::new(SOURCE_ID);
        listing.raw_text = title.clone();
        listing.fields.insert("title".to_string(), title);

        if let Some(price) = select_first_text(card, &[".price", ".car-price", ".precio"]) {
            listing.fields.insert("price".to_string(), price);
        }

        if let Some(location) = select_first_text(card, &[".location", ".car-location", ".ciudad"]) {
            listing.fields.insert("location".to_string(), location);
        }

        // Spec rows carry year, mileage, transmission and fuel in no fixed
        // order; validation sorts them out from the combined text.
        let detail_selector = Selector::parse(".details li, .car-details span, .specs span").unwrap();
        let details = card
            .select(&detail_selector)
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        if !details.is_empty() {
            listing.raw_text = format!("{} {}", listing.raw_text, details);
            listing.fields.insert("details".to_string(), details);
        }

        if let Some(href) = select_first_attr(card, &["a"], "href") {
            let absolute = self
                .base_url
                .join(&href)
                .map(|u| u.to_string())
                .unwrap_or(href);
            if let Some(captures) = self.id_re.captures(&absolute) {
                listing.external_id = Some(captures[1].to_string());
            }
            listing.url = Some(absolute);
        }

        if let Some(image) = select_first_attr(card, &["img"], "data-src")
            .or_else(|| select_first_attr(card, &["img"], "src"))
        {
            let absolute = self
                .base_url
                .join(&image)
                .map(|u| u.to_string())
                .unwrap_or(image);
            listing.images.push(absolute);
        }

        Some(listing)
    }
}

#[async_trait]
impl SourceScraper for AutocosmosScraper {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch_page(&self, page: u32) -> ScrapeResult<Vec<RawListing>> {
        let url = self.page_url(page);
        let body = self.get_text(&url).await?;
        let document = Html::parse_document(&body);
        Ok(self.parse_page(&document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_card_with_relative_links() {
        let scraper = AutocosmosScraper::new().expect("scraper builds");
        let document = Html::parse_document(
            r#"<article class="listing-item">
                 <a href="/auto/usado/chevrolet/tahoe/20771"><h3>Chevrolet Tahoe 2016</h3></a>
                 <span class="price">Bs. / $ 27.500</span>
                 <ul class="details"><li>2016</li><li>78.000 km</li><li>Automática</li></ul>
                 <img src="/img/tahoe.jpg"/>
               </article>"#,
        );

        let listings = scraper.parse_page(&document);

        assert_eq!(listings.len(), 1);
        let listing = &listings[0];
        assert_eq!(listing.external_id.as_deref(), Some("20771"));
        assert_eq!(
            listing.url.as_deref(),
            Some("https://www.autocosmos.com.ve/auto/usado/chevrolet/tahoe/20771")
        );
        assert_eq!(
            listing.images,
            vec!["https://www.autocosmos.com.ve/img/tahoe.jpg".to_string()]
        );
        assert!(listing.field("details").unwrap().contains("Automática"));
    }
}
